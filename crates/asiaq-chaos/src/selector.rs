//! ChaosSelector: picks which running instances a chaos pass kills.

use tracing::{debug, info};

use asiaq_core::{RandomSource, sample_without_replacement};
use asiaq_scheduler::Cloud;
use asiaq_state::{InstanceId, InstanceStatus};

use crate::error::{ChaosError, ChaosResult};

/// The running instances of one autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fleet {
    pub group: String,
    pub hostclass: String,
    pub instances: Vec<InstanceId>,
}

/// An instance chosen for termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub group: String,
    pub hostclass: String,
    pub instance: InstanceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosReport {
    pub environment: String,
    pub eligible: usize,
    pub victims: Vec<Victim>,
    /// Zero on a dry run.
    pub terminated: u32,
}

/// Kill level and retainage, both percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosSelector {
    level: f64,
    retainage: f64,
}

impl ChaosSelector {
    pub fn new(level: f64, retainage: f64) -> ChaosResult<Self> {
        Ok(Self {
            level: percentage("level", level)?,
            retainage: percentage("retainage", retainage)?,
        })
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn retainage(&self) -> f64 {
        self.retainage
    }

    /// Instances a fleet of `pool` running instances always keeps.
    pub fn keep_count(&self, pool: usize) -> usize {
        percent_of(self.retainage, pool).min(pool)
    }

    /// Instances to kill out of `total` eligible ones, before capping.
    pub fn kill_count(&self, total: usize) -> usize {
        percent_of(self.level, total).min(total)
    }

    /// Choose victims across `fleets`.
    ///
    /// Each fleet offers a random subset of `pool - keep` instances; the
    /// kills are then drawn without replacement from the union of those
    /// offers, so no fleet drops below its keep count.
    pub fn select(&self, fleets: &[Fleet], rng: &mut dyn RandomSource) -> Vec<Victim> {
        let total: usize = fleets.iter().map(|f| f.instances.len()).sum();
        let mut candidates = Vec::new();
        for fleet in fleets {
            let pool = fleet.instances.len();
            let offered = pool - self.keep_count(pool);
            for instance in sample_without_replacement(rng, &fleet.instances, offered) {
                candidates.push(Victim {
                    group: fleet.group.clone(),
                    hostclass: fleet.hostclass.clone(),
                    instance,
                });
            }
        }

        let kills = self.kill_count(total).min(candidates.len());
        debug!(total, candidates = candidates.len(), kills, "chaos selection");
        sample_without_replacement(rng, &candidates, kills)
    }
}

fn percentage(name: &'static str, value: f64) -> ChaosResult<f64> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ChaosError::InvalidPercentage { name, value });
    }
    Ok(value)
}

/// `ceil(pct% × n)`, tolerant of float noise (2% of 50 is 1, not 2).
fn percent_of(pct: f64, n: usize) -> usize {
    let exact = pct * n as f64 / 100.0;
    (exact - 1e-9).ceil().max(0.0) as usize
}

/// Running instances of every group that takes part in chaos.
pub async fn fleets(cloud: &dyn Cloud, environment: &str) -> ChaosResult<Vec<Fleet>> {
    let mut fleets = Vec::new();
    for group in cloud.list_groups(environment).await? {
        if !group.chaos || group.testing {
            debug!(group = %group.name, "excluded from chaos");
            continue;
        }
        let instances = cloud
            .list_instances(environment, Some(&group.name))
            .await?
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .map(|i| i.id)
            .collect();
        fleets.push(Fleet {
            group: group.name,
            hostclass: group.hostclass,
            instances,
        });
    }
    Ok(fleets)
}

/// One chaos pass over `environment`.
pub async fn run(
    cloud: &dyn Cloud,
    environment: &str,
    selector: ChaosSelector,
    rng: &mut dyn RandomSource,
    dry_run: bool,
) -> ChaosResult<ChaosReport> {
    let fleets = fleets(cloud, environment).await?;
    let eligible = fleets.iter().map(|f| f.instances.len()).sum();
    let victims = selector.select(&fleets, rng);

    let terminated = if dry_run || victims.is_empty() {
        0
    } else {
        let ids: Vec<InstanceId> = victims.iter().map(|v| v.instance.clone()).collect();
        cloud.terminate_instances(environment, &ids).await?
    };
    info!(
        %environment,
        level = selector.level(),
        retainage = selector.retainage(),
        eligible,
        selected = victims.len(),
        terminated,
        dry_run,
        "chaos pass complete"
    );
    Ok(ChaosReport {
        environment: environment.to_string(),
        eligible,
        victims,
        terminated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use asiaq_core::{ScriptedRandom, StdRandom};

    fn fleet(group: &str, size: usize) -> Fleet {
        Fleet {
            group: group.to_string(),
            hostclass: group.trim_start_matches("ci_").to_string(),
            instances: (0..size).map(|i| format!("{group}-i{i}")).collect(),
        }
    }

    #[test]
    fn two_percent_of_fifty_kills_one() {
        let selector = ChaosSelector::new(2.0, 0.0).unwrap();
        let victims = selector.select(&[fleet("ci_mhcweb", 50)], &mut StdRandom::seeded(1));
        assert_eq!(victims.len(), 1);
    }

    #[test]
    fn fractional_kill_rounds_up() {
        let selector = ChaosSelector::new(1.0, 0.0).unwrap();
        let fleets = [fleet("ci_mhcweb", 30), fleet("ci_mhcapi", 20), fleet("ci_mhcdb", 3)];
        assert_eq!(selector.select(&fleets, &mut StdRandom::seeded(2)).len(), 1);
    }

    #[test]
    fn full_retainage_kills_nothing() {
        let selector = ChaosSelector::new(100.0, 100.0).unwrap();
        let fleets = [fleet("ci_mhcweb", 50), fleet("ci_mhcapi", 1)];
        assert!(selector.select(&fleets, &mut StdRandom::seeded(3)).is_empty());
    }

    #[test]
    fn retainage_caps_kills_per_fleet() {
        let selector = ChaosSelector::new(100.0, 50.0).unwrap();
        let fleets = [fleet("ci_mhcweb", 4), fleet("ci_mhcapi", 1)];
        let victims = selector.select(&fleets, &mut StdRandom::seeded(4));
        // web keeps 2 of 4, api keeps ceil(0.5) = 1 of 1.
        assert_eq!(victims.len(), 2);
        assert!(victims.iter().all(|v| v.group == "ci_mhcweb"));
        assert_ne!(victims[0].instance, victims[1].instance);
    }

    #[test]
    fn scripted_draws_pick_exact_instances() {
        let selector = ChaosSelector::new(50.0, 0.0).unwrap();
        let fleets = [fleet("ci_mhcweb", 4)];
        // Offer shuffle is the identity, then draw candidates 3 and 0.
        let mut rng = ScriptedRandom::new([0, 0, 0, 0, 3, 2]);
        let victims: Vec<_> = selector
            .select(&fleets, &mut rng)
            .into_iter()
            .map(|v| v.instance)
            .collect();
        assert_eq!(victims, vec!["ci_mhcweb-i3", "ci_mhcweb-i0"]);
    }

    #[test]
    fn zero_level_kills_nothing() {
        let selector = ChaosSelector::new(0.0, 0.0).unwrap();
        assert!(selector.select(&[fleet("ci_mhcweb", 10)], &mut StdRandom::seeded(5)).is_empty());
    }

    #[test]
    fn out_of_range_percentages_are_rejected() {
        assert!(matches!(
            ChaosSelector::new(101.0, 0.0),
            Err(ChaosError::InvalidPercentage { name: "level", .. })
        ));
        assert!(matches!(
            ChaosSelector::new(5.0, -1.0),
            Err(ChaosError::InvalidPercentage { name: "retainage", .. })
        ));
        assert!(ChaosSelector::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn keep_count_rounds_up() {
        let selector = ChaosSelector::new(10.0, 33.3).unwrap();
        assert_eq!(selector.keep_count(3), 1);
        assert_eq!(selector.keep_count(0), 0);
        assert_eq!(selector.kill_count(0), 0);
    }
}

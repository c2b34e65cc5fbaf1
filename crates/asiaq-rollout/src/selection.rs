//! Image selection for `deploy test` and `deploy update`.

use std::collections::HashMap;

use asiaq_core::{ImageStage, RandomSource, choose_index};
use asiaq_state::Image;

fn newest<'a>(images: &'a [Image], hostclass: &str, stage: ImageStage) -> Option<&'a Image> {
    images
        .iter()
        .filter(|i| i.hostclass == hostclass && i.stage == stage)
        .max_by_key(|i| i.created_at)
}

/// Per hostclass, the newest untested image that is newer than its newest
/// tested image.
pub fn test_candidates(images: &[Image], hostclasses: &[&str]) -> Vec<Image> {
    hostclasses
        .iter()
        .filter_map(|h| {
            let untested = newest(images, h, ImageStage::Untested)?;
            match newest(images, h, ImageStage::Tested) {
                Some(tested) if tested.created_at >= untested.created_at => None,
                _ => Some(untested.clone()),
            }
        })
        .collect()
}

/// Per hostclass, the newest tested image that is newer than the image the
/// hostclass currently runs. `running` maps hostclass to image id; images
/// missing from the catalog count as older than anything in it.
pub fn update_candidates(
    images: &[Image],
    hostclasses: &[&str],
    running: &HashMap<String, String>,
) -> Vec<Image> {
    hostclasses
        .iter()
        .filter_map(|h| {
            let tested = newest(images, h, ImageStage::Tested)?;
            let current = running.get(*h);
            if current == Some(&tested.id) {
                return None;
            }
            let current_created = current
                .and_then(|id| images.iter().find(|i| &i.id == id))
                .map(|i| i.created_at);
            match current_created {
                Some(created) if created >= tested.created_at => None,
                _ => Some(tested.clone()),
            }
        })
        .collect()
}

/// One candidate, chosen uniformly.
pub fn pick(candidates: &[Image], rng: &mut dyn RandomSource) -> Option<Image> {
    choose_index(rng, candidates.len()).map(|i| candidates[i].clone())
}

//! Search for calibration images, falling back to earlier nights when the
//! current night has none.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::consts::CALHUNTER_MAX_NIGHTS;
use crate::data::Batch;
use crate::error::{DrpError, Result};
use crate::pipeline::CalRequirement;
use crate::processor::utils::{list_fits_files, LoadImageFn};

/// Nights to search: `night` itself, then earlier `YYYYMMDD` directories of
/// `raw_root`, newest first.
pub fn candidate_nights(raw_root: &Path, night: &str, max_earlier: usize) -> Vec<String> {
    let mut earlier: Vec<String> = fs::read_dir(raw_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| is_night(name) && name.as_str() < night)
                .collect()
        })
        .unwrap_or_default();
    earlier.sort_unstable_by(|a, b| b.cmp(a));
    earlier.truncate(max_earlier);

    let mut nights = vec![night.to_string()];
    nights.extend(earlier);
    nights
}

fn is_night(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Load the calibration images satisfying every requirement.
///
/// Each requirement is satisfied by all matching images of the most recent
/// night that has at least one. Fails with
/// [`DrpError::CalibrationNotFound`] if any requirement stays unmet.
pub fn find_required_cals(
    raw_root: &Path,
    night: &str,
    raw_sub_dir: &str,
    load: &LoadImageFn,
    requirements: &[CalRequirement],
) -> Result<Batch> {
    let mut found = Batch::images(Vec::new());
    let mut missing: Vec<&CalRequirement> = requirements.iter().collect();

    for candidate in candidate_nights(raw_root, night, CALHUNTER_MAX_NIGHTS) {
        if missing.is_empty() {
            break;
        }
        let dir: PathBuf = raw_root.join(&candidate).join(raw_sub_dir);
        if !dir.is_dir() {
            continue;
        }
        let mut images = Vec::new();
        for path in list_fits_files(&dir)? {
            match load(&path) {
                Ok(loaded) => images.extend(loaded),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable image: {e}"),
            }
        }

        missing.retain(|req| {
            let matching: Vec<_> = images.iter().filter(|img| req.matches(img)).cloned().collect();
            if matching.is_empty() {
                return true;
            }
            info!(
                requirement = %req,
                night = %candidate,
                images = matching.len(),
                "Found calibration images"
            );
            for image in matching {
                if let Err(e) = found.append(image) {
                    warn!("{e}");
                }
            }
            false
        });
        debug!(night = %candidate, remaining = missing.len(), "Searched night");
    }

    if missing.is_empty() {
        Ok(found)
    } else {
        let names: Vec<String> = missing.iter().map(|r| r.to_string()).collect();
        Err(DrpError::CalibrationNotFound(names.join(", ")))
    }
}

use std::sync::OnceLock;

use indexmap::IndexMap;

use crate::error::{DrpError, Result};

use super::ProcessorKind;

/// Static description of a built-in processor.
#[derive(Clone, Debug)]
pub struct ProcessorInfo {
    pub key: &'static str,
    pub kind: ProcessorKind,
    pub summary: &'static str,
}

const BUILTIN: &[(&str, ProcessorKind, &str)] = &[
    ("load", ProcessorKind::ImageToImage, "Load FITS images from a night directory"),
    ("save", ProcessorKind::ImageToImage, "Write images as FITS"),
    ("batch", ProcessorKind::ImageToImage, "Regroup images by header values"),
    ("debatch", ProcessorKind::ImageToImage, "Merge all batches into one"),
    ("select", ProcessorKind::ImageToImage, "Keep images matching header values"),
    ("reject", ProcessorKind::ImageToImage, "Drop images matching header values"),
    ("annotate", ProcessorKind::ImageToImage, "Combine header values into a new key"),
    ("edit_header", ProcessorKind::ImageToImage, "Set fixed header values"),
    ("custom", ProcessorKind::ImageToImage, "Apply a user-supplied batch function"),
    ("bias", ProcessorKind::ImageToImage, "Subtract a median master bias"),
    ("dark", ProcessorKind::ImageToImage, "Subtract an exposure-scaled master dark"),
    ("flat", ProcessorKind::ImageToImage, "Divide by a normalised master flat"),
    ("csvlog", ProcessorKind::ImageToImage, "Log header values to a CSV file"),
    ("plot", ProcessorKind::ImageToImage, "Save PNG previews"),
    ("dbexport", ProcessorKind::ImageToImage, "Export image headers to a database"),
    ("sourcetable", ProcessorKind::ImageToSources, "Build source tables from header positions"),
    ("sourceselect", ProcessorKind::SourcesToSources, "Filter sources by a numeric column"),
    ("dbexport_sources", ProcessorKind::SourcesToSources, "Export source rows to a database"),
];

/// Lookup table of every built-in processor, keyed by processor key.
pub fn builtin() -> &'static IndexMap<&'static str, ProcessorInfo> {
    static REGISTRY: OnceLock<IndexMap<&'static str, ProcessorInfo>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        BUILTIN
            .iter()
            .map(|&(key, kind, summary)| (key, ProcessorInfo { key, kind, summary }))
            .collect()
    })
}

pub fn lookup(key: &str) -> Result<&'static ProcessorInfo> {
    builtin()
        .get(key)
        .ok_or_else(|| DrpError::UnknownProcessor(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique() {
        assert_eq!(builtin().len(), BUILTIN.len());
    }

    #[test]
    fn unknown_key_is_an_error() {
        assert!(lookup("bias").is_ok());
        assert!(matches!(lookup("nope"), Err(DrpError::UnknownProcessor(_))));
    }
}

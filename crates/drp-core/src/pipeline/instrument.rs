use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::consts::{
    BASE_NAME_KEY, BIAS_OBSCLASS, DARK_OBSCLASS, EXPTIME_KEY, FLAT_OBSCLASS, OBSCLASS_KEY,
    SCIENCE_OBSCLASS,
};
use crate::data::Image;
use crate::error::{DrpError, Result};
use crate::io::fits;
use crate::processor::calibration::MasterFrameCalibrator;
use crate::processor::csvlog::CsvLog;
use crate::processor::plotter::ImagePlotter;
use crate::processor::sources::{SourceSelector, SourceTableFromHeader};
use crate::processor::utils::{ImageBatcher, ImageLoader, ImageSaver, ImageSelector, LoadImageFn};

use super::configuration::ProcessorList;

/// Header key some cameras use instead of [`OBSCLASS_KEY`].
const IMAGETYP_KEY: &str = "IMAGETYP";

/// Calibration images the monitor must find before reducing science frames:
/// raw images whose header `key` equals `value`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalRequirement {
    pub key: String,
    pub value: String,
}

impl CalRequirement {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, image: &Image) -> bool {
        image
            .header()
            .get_text(&self.key)
            .is_some_and(|v| v.eq_ignore_ascii_case(&self.value))
    }
}

impl std::fmt::Display for CalRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A deployment target: how its raw data is read and which named
/// configurations it offers.
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    /// Named processor lists, in display order.
    fn configurations(&self) -> &IndexMap<String, ProcessorList>;

    /// Configurations the monitor runs on each new science image.
    fn default_realtime_configurations(&self) -> Vec<String> {
        vec!["realtime".to_string()]
    }

    fn raw_loader(&self) -> LoadImageFn;

    fn load_raw_image(&self, path: &Path) -> Result<Vec<Image>> {
        (self.raw_loader())(path)
    }

    fn download_raw_images_for_night(&self, night: &str) -> Result<()> {
        Err(DrpError::Unsupported(format!(
            "{} cannot download raw images (night {night})",
            self.name()
        )))
    }

    fn default_cal_requirements(&self) -> Vec<CalRequirement> {
        Vec::new()
    }

    /// Steps run over the reloaded raw images named in `processed` at the
    /// end of a reduction. The caller supplies the loader, so the default
    /// concatenates `selected` with their own load steps removed.
    fn postprocess_configuration(
        &self,
        _processed: &[String],
        selected: &[String],
    ) -> Result<ProcessorList> {
        let mut list = ProcessorList::new();
        for name in selected {
            list = list + configuration(self, name)?.without(ImageLoader::KEY);
        }
        Ok(list)
    }
}

/// Look up a named configuration of `instrument`.
pub fn configuration<'a, I: Instrument + ?Sized>(
    instrument: &'a I,
    name: &str,
) -> Result<&'a ProcessorList> {
    let configs = instrument.configurations();
    configs
        .get(name)
        .ok_or_else(|| DrpError::UnknownConfiguration {
            name: name.to_string(),
            available: configs.keys().cloned().collect(),
        })
}

/// Single-HDU FITS target with bias/dark/flat calibration.
pub struct GenericInstrument {
    configurations: IndexMap<String, ProcessorList>,
}

impl Default for GenericInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericInstrument {
    pub const NAME: &'static str = "generic";

    pub fn new() -> Self {
        let load = ProcessorList::new()
            .then(ImageLoader::default().with_loader(generic_loader()));
        let log = ProcessorList::new().then(CsvLog::new([
            OBSCLASS_KEY,
            EXPTIME_KEY,
            "FILTER",
            "OBJECT",
            "DATE-OBS",
        ]));
        let calibrate = ProcessorList::new()
            .then(MasterFrameCalibrator::bias())
            .then(MasterFrameCalibrator::dark())
            .then(MasterFrameCalibrator::flat());
        let science = ProcessorList::new()
            .then(ImageSelector::new(OBSCLASS_KEY, [SCIENCE_OBSCLASS]))
            .then(ImageBatcher::new([BASE_NAME_KEY]));
        let finish = ProcessorList::new()
            .then(ImageSaver::new("final"))
            .then(ImagePlotter::default());

        let mut configurations = IndexMap::new();
        configurations.insert("log".to_string(), load.clone() + log.clone());
        configurations.insert(
            "default".to_string(),
            load.clone() + log + calibrate.clone() + science.clone() + finish.clone(),
        );
        configurations.insert("calibration".to_string(), load.clone() + calibrate.clone());
        configurations.insert(
            "sources".to_string(),
            load
                + ProcessorList::new()
                    .then(ImageSelector::new(OBSCLASS_KEY, [SCIENCE_OBSCLASS]))
                    .then(SourceTableFromHeader::default())
                    .then(SourceSelector::new("DEC", -90.0, 90.0)),
        );
        configurations.insert("realtime".to_string(), calibrate + science + finish);
        Self { configurations }
    }
}

impl Instrument for GenericInstrument {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configurations(&self) -> &IndexMap<String, ProcessorList> {
        &self.configurations
    }

    fn raw_loader(&self) -> LoadImageFn {
        generic_loader()
    }

    fn default_cal_requirements(&self) -> Vec<CalRequirement> {
        [BIAS_OBSCLASS, DARK_OBSCLASS, FLAT_OBSCLASS]
            .into_iter()
            .map(|class| CalRequirement::new(OBSCLASS_KEY, class))
            .collect()
    }
}

/// FITS loader that derives `OBSCLASS` from `IMAGETYP` when absent.
pub fn generic_loader() -> LoadImageFn {
    Arc::new(|path: &Path| {
        let mut image = fits::open_image(path)?;
        if !image.header().contains_key(OBSCLASS_KEY) {
            let class = image
                .header()
                .get_text(IMAGETYP_KEY)
                .map(|t| obsclass_from_imagetyp(&t))
                .unwrap_or(SCIENCE_OBSCLASS);
            image.header_mut().insert(OBSCLASS_KEY, class);
        }
        Ok(vec![image])
    })
}

fn obsclass_from_imagetyp(imagetyp: &str) -> &'static str {
    let t = imagetyp.to_ascii_lowercase();
    if t.contains("bias") || t.contains("zero") {
        BIAS_OBSCLASS
    } else if t.contains("dark") {
        DARK_OBSCLASS
    } else if t.contains("flat") {
        FLAT_OBSCLASS
    } else {
        SCIENCE_OBSCLASS
    }
}

/// Resolve a built-in instrument by name.
pub fn get_instrument(name: &str) -> Result<Arc<dyn Instrument>> {
    if name.eq_ignore_ascii_case(GenericInstrument::NAME) {
        Ok(Arc::new(GenericInstrument::new()))
    } else {
        Err(DrpError::UnknownInstrument(name.to_string()))
    }
}

/// Names of every built-in instrument.
pub fn instrument_names() -> &'static [&'static str] {
    &[GenericInstrument::NAME]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imagetyp_mapping() {
        assert_eq!(obsclass_from_imagetyp("Bias Frame"), BIAS_OBSCLASS);
        assert_eq!(obsclass_from_imagetyp("ZERO"), BIAS_OBSCLASS);
        assert_eq!(obsclass_from_imagetyp("Dark Frame"), DARK_OBSCLASS);
        assert_eq!(obsclass_from_imagetyp("Flat Field"), FLAT_OBSCLASS);
        assert_eq!(obsclass_from_imagetyp("Light Frame"), SCIENCE_OBSCLASS);
    }

    #[test]
    fn generic_configurations_validate() {
        let inst = GenericInstrument::new();
        for (name, list) in inst.configurations() {
            list.validate()
                .unwrap_or_else(|e| panic!("{name} failed validation: {e}"));
        }
        assert!(configuration(&inst, "realtime").is_ok());
        assert!(matches!(
            configuration(&inst, "nope"),
            Err(DrpError::UnknownConfiguration { .. })
        ));
    }

    #[test]
    fn unknown_instrument() {
        assert!(get_instrument("GENERIC").is_ok());
        assert!(matches!(
            get_instrument("wirc"),
            Err(DrpError::UnknownInstrument(_))
        ));
    }
}

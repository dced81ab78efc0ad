//! PARASOL field catalog and channel layout.
//!
//! The raw sensor array stores every catalog field back to back along the
//! channel axis. Directional fields occupy [`NUM_ANGLES`] consecutive channels
//! (one per viewing angle); every other field occupies a single channel.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AtrainError, AtrainResult};

/// Number of viewing angles stored for each directional field.
pub const NUM_ANGLES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldGroup {
    #[serde(rename = "Data_Directional_Fields")]
    DataDirectional,
    #[serde(rename = "Data_Fields")]
    Data,
    #[serde(rename = "Geolocation_Fields")]
    Geolocation,
    #[serde(rename = "Quality_Flags_Directional_Fields")]
    QualityFlagsDirectional,
}

impl FieldGroup {
    /// Only the data group is expanded per angle in the stored arrays.
    pub fn is_directional(self) -> bool {
        matches!(self, Self::DataDirectional)
    }
}

/// A `(group, name)` pair; serialised as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(FieldGroup, String)", into = "(FieldGroup, String)")]
pub struct Field {
    pub group: FieldGroup,
    pub name: String,
}

impl Field {
    pub fn new(group: FieldGroup, name: impl Into<String>) -> Self {
        Self {
            group,
            name: name.into(),
        }
    }

    fn directional(name: &str) -> Self {
        Self::new(FieldGroup::DataDirectional, name)
    }
}

impl From<(FieldGroup, String)> for Field {
    fn from((group, name): (FieldGroup, String)) -> Self {
        Self { group, name }
    }
}

impl From<Field> for (FieldGroup, String) {
    fn from(field: Field) -> Self {
        (field.group, field.name)
    }
}

const DIRECTIONAL_RADIANCES: [&str; 15] = [
    "I443NP", "I490P", "Q490P", "U490P", "I565NP", "I670P", "Q670P", "U670P", "I763NP", "I765NP",
    "I865P", "Q865P", "U865P", "I910NP", "I1020NP",
];
const DIRECTIONAL_GEOMETRY: [&str; 3] = ["phi", "thetas", "thetav"];

const BANDS: [(u32, &[&str]); 9] = [
    (443, &["I443NP"]),
    (490, &["I490P", "Q490P", "U490P"]),
    (565, &["I565NP"]),
    (670, &["I670P", "Q670P", "U670P"]),
    (763, &["I763NP"]),
    (765, &["I765NP"]),
    (865, &["I865P", "Q865P", "U865P"]),
    (910, &["I910NP"]),
    (1020, &["I1020NP"]),
];

/// Named field lists used to pick the model's input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPreset {
    All,
    Default,
    Directional,
    Minimal,
    SingleBand(u32),
}

impl FromStr for FieldPreset {
    type Err = AtrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "default" => Ok(Self::Default),
            "directional" => Ok(Self::Directional),
            "minimal" => Ok(Self::Minimal),
            other => other
                .strip_prefix("single_band_")
                .and_then(|wl| wl.parse::<u32>().ok())
                .filter(|wl| BANDS.iter().any(|(band, _)| band == wl))
                .map(Self::SingleBand)
                .ok_or_else(|| AtrainError::UnknownFieldPreset(s.to_string())),
        }
    }
}

impl FieldPreset {
    pub fn fields(self) -> Vec<Field> {
        match self {
            Self::All => {
                let mut fields = directional_fields();
                fields.extend([
                    Field::new(FieldGroup::Data, "Nviews"),
                    Field::new(FieldGroup::Data, "cloud_indicator"),
                    Field::new(FieldGroup::Data, "phis"),
                ]);
                fields.extend(geolocation_fields());
                fields.extend((1..=14).map(|flag| {
                    Field::new(
                        FieldGroup::QualityFlagsDirectional,
                        format!("Quality_Flags_{flag:02}"),
                    )
                }));
                fields
            }
            Self::Default => {
                let mut fields = directional_fields();
                fields.extend([
                    Field::new(FieldGroup::Data, "Nviews"),
                    Field::new(FieldGroup::Data, "cloud_indicator"),
                ]);
                fields.extend(geolocation_fields());
                fields
            }
            Self::Directional => directional_fields(),
            Self::Minimal => vec![
                Field::directional("I865NP"),
                Field::new(FieldGroup::Data, "Nviews"),
                Field::new(FieldGroup::Data, "cloud_indicator"),
                Field::new(FieldGroup::Geolocation, "Latitude"),
                Field::new(FieldGroup::Geolocation, "Longitude"),
            ],
            Self::SingleBand(wavelength) => {
                let band = BANDS
                    .iter()
                    .find(|(band, _)| *band == wavelength)
                    .map(|(_, names)| *names)
                    .unwrap_or(&[]);
                band.iter()
                    .chain(DIRECTIONAL_GEOMETRY.iter())
                    .map(|name| Field::directional(name))
                    .collect()
            }
        }
    }
}

fn directional_fields() -> Vec<Field> {
    DIRECTIONAL_RADIANCES
        .iter()
        .chain(DIRECTIONAL_GEOMETRY.iter())
        .map(|name| Field::directional(name))
        .collect()
}

fn geolocation_fields() -> Vec<Field> {
    ["Latitude", "Longitude", "land_sea_flag", "surface_altitude"]
        .into_iter()
        .map(|name| Field::new(FieldGroup::Geolocation, name))
        .collect()
}

/// Raw-array channel indices for a requested field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Selected directional channels, field-major then angle.
    pub multi_angle_idx: Vec<usize>,
    /// Selected single-channel fields, in catalog order.
    pub nondir_idx: Vec<usize>,
    pub nondir_fields: Vec<String>,
    pub num_angles: usize,
    pub total_channels: usize,
}

impl ChannelLayout {
    /// Walk `catalog` in order, assigning raw channel offsets, and keep the
    /// channels of every field that also appears in `requested`.
    pub fn new(
        catalog: &[Field],
        requested: &[Field],
        angles_to_omit: &[usize],
    ) -> AtrainResult<Self> {
        if let Some(&angle) = angles_to_omit.iter().find(|&&a| a >= NUM_ANGLES) {
            return Err(AtrainError::InvalidAngle(angle));
        }

        let mut multi_angle_idx = Vec::new();
        let mut nondir_idx = Vec::new();
        let mut nondir_fields = Vec::new();
        let mut channel_idx = 0;

        for field in catalog {
            let selected = requested.contains(field);
            if field.group.is_directional() {
                if selected {
                    multi_angle_idx.extend(
                        (0..NUM_ANGLES)
                            .filter(|angle| !angles_to_omit.contains(angle))
                            .map(|angle| channel_idx + angle),
                    );
                }
                channel_idx += NUM_ANGLES;
            } else {
                if selected {
                    nondir_fields.push(field.name.clone());
                    nondir_idx.push(channel_idx);
                }
                channel_idx += 1;
            }
        }

        let mut omitted: Vec<usize> = angles_to_omit.to_vec();
        omitted.sort_unstable();
        omitted.dedup();

        Ok(Self {
            multi_angle_idx,
            nondir_idx,
            nondir_fields,
            num_angles: NUM_ANGLES - omitted.len(),
            total_channels: channel_idx,
        })
    }

    pub fn input_channels(&self) -> usize {
        self.multi_angle_idx.len()
    }
}

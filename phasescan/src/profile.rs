//! Static per-cavity configuration
//!
//! One [`CavityProfile`] per cavity, held in beam order by a [`CavityTable`].
//! Everything the sequencer needs about a cavity is read from its profile, so
//! channel names, geometry and fit parameters can never drift out of step.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Peak-field factor for room-temperature bunchers
pub const BUNCHER_PEAK_FIELD_FACTOR: f64 = 1.0;

/// Peak-field factor for superconducting half-wave resonators
pub const HALF_WAVE_PEAK_FIELD_FACTOR: f64 = 25.0;

/// Cavity category, which selects the peak-field factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CavityCategory {
    /// Room-temperature buncher
    Buncher,
    /// Superconducting half-wave resonator
    HalfWave,
}

impl CavityCategory {
    /// Peak-field factor for this category
    pub fn peak_field_factor(self) -> f64 {
        match self {
            CavityCategory::Buncher => BUNCHER_PEAK_FIELD_FACTOR,
            CavityCategory::HalfWave => HALF_WAVE_PEAK_FIELD_FACTOR,
        }
    }
}

/// How a commanded phase is confirmed before sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmPolicy {
    /// Re-issue the setpoint until the readback agrees (bounded)
    ClosedLoop,
    /// Issue the setpoint a fixed number of times without checking
    FixedRetry,
}

/// Static parameters for one cavity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CavityProfile {
    /// Operator-facing cavity name, also used to name the sweep log
    pub name: String,
    /// Phase setpoint channel
    pub set_channel: String,
    /// Phase readback channel (equal to `set_channel` without independent readback)
    pub readback_channel: String,
    /// Downstream BPM phase channel
    pub bpm_channel: String,
    /// Cavity-to-BPM distance in meters
    pub distance_m: f64,
    /// Design synchronous phase in degrees
    pub synch_phase_deg: f64,
    /// Field-profile identifier passed to the fitter
    pub field_profile: String,
    /// Energy-gain slope correction
    pub slope: f64,
    /// Cavity category
    pub category: CavityCategory,
    /// Overrides the category peak-field factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_field_override: Option<f64>,
    /// Settle confirmation policy
    pub confirm_policy: ConfirmPolicy,
}

impl CavityProfile {
    /// Peak-field factor used for this cavity's fit
    pub fn peak_field_factor(&self) -> f64 {
        self.peak_field_override
            .unwrap_or_else(|| self.category.peak_field_factor())
    }

    /// True when the readback is a separate channel from the setpoint
    pub fn has_independent_readback(&self) -> bool {
        self.readback_channel != self.set_channel
    }
}

/// Ordered cavity profiles, indexed 0..N-1 in beam order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CavityTable {
    /// Profiles in beam order
    pub cavities: Vec<CavityProfile>,
}

impl CavityTable {
    /// Create a table from profiles in beam order
    pub fn new(cavities: Vec<CavityProfile>) -> Self {
        Self { cavities }
    }

    /// Number of cavities
    pub fn len(&self) -> usize {
        self.cavities.len()
    }

    /// True when the table has no cavities
    pub fn is_empty(&self) -> bool {
        self.cavities.is_empty()
    }

    /// Profile at `index`
    pub fn get(&self, index: usize) -> Option<&CavityProfile> {
        self.cavities.get(index)
    }

    /// Index of the cavity called `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.cavities.iter().position(|c| c.name == name)
    }

    /// Iterate profiles in beam order
    pub fn iter(&self) -> impl Iterator<Item = &CavityProfile> {
        self.cavities.iter()
    }

    /// Built-in table for the injector: two bunchers followed by twelve
    /// half-wave resonators in two cryomodules.
    pub fn injector() -> Self {
        let mut cavities = Vec::with_capacity(14);

        for (i, (distance, bpm)) in [(0.1, "Bpm:2-P11"), (0.15, "Bpm:5-P11")]
            .into_iter()
            .enumerate()
        {
            let set = format!("LLRF:Buncher{}:PHA_SET", i + 1);
            cavities.push(CavityProfile {
                name: format!("buncher{}", i + 1),
                readback_channel: set.clone(),
                set_channel: set,
                bpm_channel: bpm.to_string(),
                distance_m: distance,
                synch_phase_deg: -90.0,
                field_profile: "buncher_field.txt".to_string(),
                slope: 1.0,
                category: CavityCategory::Buncher,
                peak_field_override: None,
                confirm_policy: ConfirmPolicy::FixedRetry,
            });
        }

        // First cryomodule has an independent phase readback per cavity
        for n in 1..=6 {
            cavities.push(CavityProfile {
                name: format!("hwr{n}"),
                set_channel: format!("SCRF:CAV{n}:PHASE:SETPOINT"),
                readback_channel: format!("SCRF:CAV{n}:PHASE:READBACK"),
                bpm_channel: format!("Bpm:{}-P11", n + 5),
                distance_m: 0.1026,
                synch_phase_deg: if n <= 3 { -25.0 } else { -20.0 },
                field_profile: "Exyz.txt".to_string(),
                slope: 0.95,
                category: CavityCategory::HalfWave,
                peak_field_override: None,
                confirm_policy: ConfirmPolicy::ClosedLoop,
            });
        }

        for n in 1..=6 {
            let set = format!("LLRF:CM2_Cavity{n}:PHA_SET");
            cavities.push(CavityProfile {
                name: format!("hwr{}", n + 6),
                readback_channel: set.clone(),
                set_channel: set,
                bpm_channel: format!("Bpm:{}-P11", n + 11),
                distance_m: 0.1026,
                synch_phase_deg: -20.0,
                field_profile: "Exyz.txt".to_string(),
                slope: 1.0,
                category: CavityCategory::HalfWave,
                peak_field_override: None,
                confirm_policy: ConfirmPolicy::FixedRetry,
            });
        }

        Self { cavities }
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        let table: Self = serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        table.check_names()?;
        Ok(table)
    }

    /// Names are unique and usable as a single file name inside a run directory
    fn check_names(&self) -> Result<(), std::io::Error> {
        for (i, cavity) in self.cavities.iter().enumerate() {
            if !is_plain_file_name(&cavity.name) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("cavity name is not a plain file name: {:?}", cavity.name),
                ));
            }
            if self.cavities[..i].iter().any(|c| c.name == cavity.name) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("duplicate cavity name: {}", cavity.name),
                ));
            }
        }
        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.contains(['/', '\\', '\0'])
}

impl Default for CavityTable {
    fn default() -> Self {
        Self::injector()
    }
}

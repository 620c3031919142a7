//! Simulated linac backend
//!
//! Models a chain of RF cavities, each followed by a BPM measuring beam
//! arrival phase. A cavity only accelerates once its setpoint has been written
//! at least once, so an unscanned downstream section stays transparent.
//! The BPM reading is the time-of-flight phase over the cavity-to-BPM drift
//! relative to the unaccelerated beam, plus Gaussian read noise.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use crate::channel::{
    ChannelBackend, ChannelError, ChannelResult, ChannelSession, HardwareChannel,
};

/// Proton rest energy in MeV
pub const PROTON_REST_MEV: f64 = 938.272;

/// Speed of light in m/s
const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Standard deviation of readback jitter in degrees
const READBACK_JITTER_DEG: f64 = 0.2;

/// One simulated cavity and its downstream BPM
#[derive(Debug, Clone)]
pub struct SimCavity {
    /// Phase setpoint channel
    pub set_channel: String,
    /// Independent readback channel, if the cavity has one
    pub readback_channel: Option<String>,
    /// Downstream BPM phase channel
    pub bpm_channel: String,
    /// Cavity-to-BPM drift length in meters
    pub distance_m: f64,
    /// Setpoint at which the cavity gives maximum energy gain (degrees)
    pub crest_deg: f64,
    /// Maximum energy gain in MeV
    pub voltage_mv: f64,
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Set(usize),
    Readback(usize),
    Bpm(usize),
}

struct LinacState {
    setpoints: Vec<Option<f64>>,
    rng: ChaCha8Rng,
}

struct LinacInner {
    cavities: Vec<SimCavity>,
    endpoints: HashMap<String, Endpoint>,
    injection_energy_mev: f64,
    rf_frequency_mhz: f64,
    bpm_noise: Normal<f64>,
    readback_noise: Normal<f64>,
    state: Mutex<LinacState>,
}

/// Kinetic energy to relativistic beta
pub fn beta_from_kinetic(kinetic_mev: f64, rest_mev: f64) -> f64 {
    let gamma = 1.0 + kinetic_mev / rest_mev;
    (1.0 - 1.0 / (gamma * gamma)).sqrt()
}

/// RF phase (degrees) accumulated while drifting `distance_m` at `kinetic_mev`
pub fn drift_phase_deg(kinetic_mev: f64, distance_m: f64, rf_frequency_mhz: f64) -> f64 {
    let beta = beta_from_kinetic(kinetic_mev, PROTON_REST_MEV);
    360.0 * rf_frequency_mhz * 1.0e6 * distance_m / (beta * SPEED_OF_LIGHT)
}

/// Simulated linac implementing [`ChannelBackend`]
#[derive(Clone)]
pub struct SimulatedLinac {
    inner: Arc<LinacInner>,
}

impl SimulatedLinac {
    /// Build a simulated linac.
    ///
    /// # Arguments
    /// * `cavities` - Cavities in beam order
    /// * `injection_energy_mev` - Kinetic energy entering the first cavity
    /// * `rf_frequency_mhz` - RF frequency used to convert time of flight to phase
    /// * `bpm_noise_deg` - Standard deviation of BPM read noise
    /// * `seed` - Noise generator seed
    pub fn new(
        cavities: Vec<SimCavity>,
        injection_energy_mev: f64,
        rf_frequency_mhz: f64,
        bpm_noise_deg: f64,
        seed: u64,
    ) -> ChannelResult<Self> {
        let bpm_noise = Normal::new(0.0, bpm_noise_deg.max(0.0))
            .map_err(|e| ChannelError::Context(format!("invalid BPM noise: {e}")))?;
        let readback_noise = Normal::new(0.0, READBACK_JITTER_DEG)
            .map_err(|e| ChannelError::Context(format!("invalid readback noise: {e}")))?;

        let mut endpoints = HashMap::new();
        for (i, cavity) in cavities.iter().enumerate() {
            endpoints.insert(cavity.set_channel.clone(), Endpoint::Set(i));
            if let Some(readback) = &cavity.readback_channel {
                endpoints.insert(readback.clone(), Endpoint::Readback(i));
            }
            endpoints.insert(cavity.bpm_channel.clone(), Endpoint::Bpm(i));
        }

        let state = LinacState {
            setpoints: vec![None; cavities.len()],
            rng: ChaCha8Rng::seed_from_u64(seed),
        };

        info!(
            "Simulated linac: {} cavities, injection {:.3} MeV, {:.1} MHz",
            cavities.len(),
            injection_energy_mev,
            rf_frequency_mhz
        );

        Ok(Self {
            inner: Arc::new(LinacInner {
                cavities,
                endpoints,
                injection_energy_mev,
                rf_frequency_mhz,
                bpm_noise,
                readback_noise,
                state: Mutex::new(state),
            }),
        })
    }

    /// Kinetic energy after `index` at the current setpoints (noise free)
    pub fn energy_after(&self, index: usize) -> f64 {
        let state = self.inner.lock_state();
        self.inner.energy_after(&state, index)
    }
}

impl LinacInner {
    fn lock_state(&self) -> MutexGuard<'_, LinacState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn energy_gain(&self, state: &LinacState, index: usize) -> f64 {
        let cavity = &self.cavities[index];
        match state.setpoints[index] {
            Some(phase) => cavity.voltage_mv * ((phase - cavity.crest_deg) * PI / 180.0).cos(),
            None => 0.0,
        }
    }

    fn energy_after(&self, state: &LinacState, index: usize) -> f64 {
        self.injection_energy_mev
            + (0..=index.min(self.cavities.len().saturating_sub(1)))
                .map(|i| self.energy_gain(state, i))
                .sum::<f64>()
    }

    fn read(&self, name: &str) -> ChannelResult<f64> {
        let endpoint = self
            .endpoints
            .get(name)
            .copied()
            .ok_or_else(|| ChannelError::UnknownChannel(name.to_string()))?;

        let mut state = self.lock_state();
        let value = match endpoint {
            Endpoint::Set(i) => state.setpoints[i].unwrap_or(0.0),
            Endpoint::Readback(i) => {
                let jitter = self.readback_noise.sample(&mut state.rng);
                state.setpoints[i].unwrap_or(0.0) + jitter
            }
            Endpoint::Bpm(i) => {
                let cavity = &self.cavities[i];
                let upstream = if i == 0 {
                    self.injection_energy_mev
                } else {
                    self.energy_after(&state, i - 1)
                };
                let energy = upstream + self.energy_gain(&state, i);
                let phase = drift_phase_deg(energy, cavity.distance_m, self.rf_frequency_mhz)
                    - drift_phase_deg(upstream, cavity.distance_m, self.rf_frequency_mhz);
                phase + self.bpm_noise.sample(&mut state.rng)
            }
        };
        Ok(value)
    }

    fn write(&self, name: &str, value: f64) -> ChannelResult<()> {
        match self.endpoints.get(name) {
            Some(Endpoint::Set(i)) => {
                debug!("sim: {name} <- {value:.2}");
                self.lock_state().setpoints[*i] = Some(value);
                Ok(())
            }
            Some(_) => Err(ChannelError::PutRejected {
                name: name.to_string(),
                value,
            }),
            None => Err(ChannelError::UnknownChannel(name.to_string())),
        }
    }
}

impl ChannelBackend for SimulatedLinac {
    fn connect(&self) -> ChannelResult<Box<dyn ChannelSession>> {
        debug!("sim: context created");
        Ok(Box::new(SimSession {
            linac: self.inner.clone(),
        }))
    }
}

struct SimSession {
    linac: Arc<LinacInner>,
}

impl ChannelSession for SimSession {
    fn open(&mut self, name: &str) -> ChannelResult<Box<dyn HardwareChannel>> {
        if !self.linac.endpoints.contains_key(name) {
            return Err(ChannelError::UnknownChannel(name.to_string()));
        }
        Ok(Box::new(SimChannel {
            name: name.to_string(),
            linac: self.linac.clone(),
        }))
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        debug!("sim: context released");
    }
}

struct SimChannel {
    name: String,
    linac: Arc<LinacInner>,
}

impl HardwareChannel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self) -> ChannelResult<f64> {
        self.linac.read(&self.name)
    }

    fn put(&mut self, value: f64) -> ChannelResult<()> {
        self.linac.write(&self.name, value)
    }
}

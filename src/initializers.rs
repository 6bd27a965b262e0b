//! Weight initializers.
//!
//! Every initializer is a pure function of `(fan_in, fan_out, shape)` and its
//! own seed: calling [`Initializer::initialize`] twice with the same arguments
//! yields bit-identical arrays. Hyperparameters are validated when an
//! initializer is constructed through the checked constructors and again when
//! a deserialized configuration is compiled.

use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Distribution as _, Normal, StandardNormal};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seed used when none is given.
pub const DEFAULT_SEED: u64 = 12;

/// Stddev of a standard normal truncated to two standard deviations.
const TRUNCATION_CORRECTION: f64 = 0.879_625_661_034_239_78;

/// Which fan the variance is scaled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FanMode {
    FanIn,
    FanOut,
    FanAvg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distribution {
    TruncatedNormal,
    UntruncatedNormal,
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant { value: f32 },
    RandomUniform { min: f32, max: f32, seed: u64 },
    RandomNormal { mean: f32, stddev: f32, seed: u64 },
    /// Normal samples outside two standard deviations are redrawn.
    TruncatedNormal { mean: f32, stddev: f32, seed: u64 },
    VarianceScaling { scale: f64, mode: FanMode, distribution: Distribution, seed: u64 },
    GlorotNormal { seed: u64 },
    GlorotUniform { seed: u64 },
    HeNormal { seed: u64 },
    HeUniform { seed: u64 },
    LeCunNormal { seed: u64 },
    LeCunUniform { seed: u64 },
    /// Scaled identity matrix; only valid for 2-D shapes.
    Identity { gain: f32 },
}

impl Initializer {
    pub fn constant(value: f32) -> Self {
        Initializer::Constant { value }
    }

    pub fn random_uniform(min: f32, max: f32, seed: u64) -> Result<Self> {
        let init = Initializer::RandomUniform { min, max, seed };
        init.validate()?;
        Ok(init)
    }

    pub fn random_normal(mean: f32, stddev: f32, seed: u64) -> Result<Self> {
        let init = Initializer::RandomNormal { mean, stddev, seed };
        init.validate()?;
        Ok(init)
    }

    pub fn truncated_normal(mean: f32, stddev: f32, seed: u64) -> Result<Self> {
        let init = Initializer::TruncatedNormal { mean, stddev, seed };
        init.validate()?;
        Ok(init)
    }

    pub fn variance_scaling(scale: f64, mode: FanMode, distribution: Distribution, seed: u64) -> Result<Self> {
        let init = Initializer::VarianceScaling { scale, mode, distribution, seed };
        init.validate()?;
        Ok(init)
    }

    pub fn glorot_uniform() -> Self {
        Initializer::GlorotUniform { seed: DEFAULT_SEED }
    }

    pub fn glorot_normal() -> Self {
        Initializer::GlorotNormal { seed: DEFAULT_SEED }
    }

    pub fn he_normal() -> Self {
        Initializer::HeNormal { seed: DEFAULT_SEED }
    }

    pub fn he_uniform() -> Self {
        Initializer::HeUniform { seed: DEFAULT_SEED }
    }

    /// Rejects hyperparameters that cannot produce a meaningful tensor.
    pub fn validate(&self) -> Result<()> {
        match self {
            Initializer::RandomUniform { min, max, .. } if !(min <= max) => Err(Error::config(format!(
                "RandomUniform requires min <= max, got min = {}, max = {}",
                min, max
            ))),
            Initializer::RandomNormal { stddev, .. } | Initializer::TruncatedNormal { stddev, .. }
                if !(stddev.is_finite() && *stddev >= 0.0) =>
            {
                Err(Error::config(format!("stddev must be finite and non-negative, got {}", stddev)))
            }
            Initializer::VarianceScaling { scale, .. } if !(*scale > 0.0) => Err(Error::config(format!(
                "The 'scale' parameter value must be more than 0.0, got {}",
                scale
            ))),
            _ => Ok(()),
        }
    }

    /// `(scale, mode, distribution, seed)` for the variance-scaling family.
    fn variance_scaling_params(&self) -> Option<(f64, FanMode, Distribution, u64)> {
        use Distribution::*;
        match *self {
            Initializer::VarianceScaling { scale, mode, distribution, seed } => Some((scale, mode, distribution, seed)),
            Initializer::GlorotNormal { seed } => Some((1.0, FanMode::FanAvg, TruncatedNormal, seed)),
            Initializer::GlorotUniform { seed } => Some((1.0, FanMode::FanAvg, Uniform, seed)),
            Initializer::HeNormal { seed } => Some((2.0, FanMode::FanIn, TruncatedNormal, seed)),
            Initializer::HeUniform { seed } => Some((2.0, FanMode::FanIn, Uniform, seed)),
            Initializer::LeCunNormal { seed } => Some((1.0, FanMode::FanIn, TruncatedNormal, seed)),
            Initializer::LeCunUniform { seed } => Some((1.0, FanMode::FanIn, Uniform, seed)),
            _ => None,
        }
    }

    /// Produces the initial value of a variable of the given shape.
    pub fn initialize(&self, fan_in: usize, fan_out: usize, shape: &[usize]) -> Result<ArrayD<f32>> {
        self.validate()?;
        let dim = IxDyn(shape);

        if let Some((scale, mode, distribution, seed)) = self.variance_scaling_params() {
            if !(scale > 0.0) {
                return Err(Error::config(format!("The 'scale' parameter value must be more than 0.0, got {}", scale)));
            }
            let denom = match mode {
                FanMode::FanIn => (fan_in as f64).max(1.0),
                FanMode::FanOut => (fan_out as f64).max(1.0),
                FanMode::FanAvg => ((fan_in + fan_out) as f64 / 2.0).max(1.0),
            };
            let variance = scale / denom;
            let mut rng = StdRng::seed_from_u64(seed);
            return Ok(match distribution {
                Distribution::TruncatedNormal => {
                    let stddev = (variance.sqrt() / TRUNCATION_CORRECTION) as f32;
                    truncated_normal(dim, 0.0, stddev, &mut rng)
                }
                Distribution::UntruncatedNormal => {
                    let stddev = variance.sqrt() as f32;
                    ArrayD::<f32>::random_using(dim, StandardNormal, &mut rng).mapv(|z: f32| z * stddev)
                }
                Distribution::Uniform => {
                    let limit = (3.0 * variance).sqrt() as f32;
                    uniform(dim, -limit, limit, &mut rng)
                }
            });
        }

        match *self {
            Initializer::Zeros => Ok(ArrayD::zeros(dim)),
            Initializer::Ones => Ok(ArrayD::ones(dim)),
            Initializer::Constant { value } => Ok(ArrayD::from_elem(dim, value)),
            Initializer::RandomUniform { min, max, seed } => {
                Ok(uniform(dim, min, max, &mut StdRng::seed_from_u64(seed)))
            }
            Initializer::RandomNormal { mean, stddev, seed } => {
                let normal = Normal::new(mean, stddev).map_err(|e| Error::config(e.to_string()))?;
                Ok(ArrayD::random_using(dim, normal, &mut StdRng::seed_from_u64(seed)))
            }
            Initializer::TruncatedNormal { mean, stddev, seed } => {
                Ok(truncated_normal(dim, mean, stddev, &mut StdRng::seed_from_u64(seed)))
            }
            Initializer::Identity { gain } => {
                if shape.len() != 2 {
                    return Err(Error::config(format!(
                        "Identity initializer requires a 2-D shape, got {:?}",
                        shape
                    )));
                }
                let mut eye = ArrayD::zeros(dim);
                for i in 0..shape[0].min(shape[1]) {
                    eye[[i, i]] = gain;
                }
                Ok(eye)
            }
            _ => Err(Error::config(format!("{} has no direct sampling rule", self))),
        }
    }
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::Zeros => write!(f, "Zeros"),
            Initializer::Ones => write!(f, "Ones"),
            Initializer::Constant { value } => write!(f, "Constant(value={})", value),
            Initializer::RandomUniform { min, max, seed } => {
                write!(f, "RandomUniform(min={}, max={}, seed={})", min, max, seed)
            }
            Initializer::RandomNormal { mean, stddev, seed } => {
                write!(f, "RandomNormal(mean={}, stddev={}, seed={})", mean, stddev, seed)
            }
            Initializer::TruncatedNormal { mean, stddev, seed } => {
                write!(f, "TruncatedNormal(mean={}, stddev={}, seed={})", mean, stddev, seed)
            }
            Initializer::VarianceScaling { scale, mode, distribution, seed } => write!(
                f,
                "VarianceScaling(scale={}, mode={:?}, distribution={:?}, seed={})",
                scale, mode, distribution, seed
            ),
            Initializer::GlorotNormal { seed } => write!(f, "GlorotNormal(seed={})", seed),
            Initializer::GlorotUniform { seed } => write!(f, "GlorotUniform(seed={})", seed),
            Initializer::HeNormal { seed } => write!(f, "HeNormal(seed={})", seed),
            Initializer::HeUniform { seed } => write!(f, "HeUniform(seed={})", seed),
            Initializer::LeCunNormal { seed } => write!(f, "LeCunNormal(seed={})", seed),
            Initializer::LeCunUniform { seed } => write!(f, "LeCunUniform(seed={})", seed),
            Initializer::Identity { gain } => write!(f, "Identity(gain={})", gain),
        }
    }
}

fn uniform(dim: IxDyn, min: f32, max: f32, rng: &mut StdRng) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(dim, || min + rng.gen::<f32>() * (max - min))
}

fn truncated_normal(dim: IxDyn, mean: f32, stddev: f32, rng: &mut StdRng) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(dim, || loop {
        let z: f32 = StandardNormal.sample(&mut *rng);
        if z.abs() <= 2.0 {
            break mean + stddev * z;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glorot_uniform_seed_12_is_reproducible() {
        let init = Initializer::glorot_uniform();
        let first = init.initialize(2, 4, &[2, 2]).unwrap();
        let second = init.initialize(2, 4, &[2, 2]).unwrap();
        assert_eq!(first, second);

        // limit = sqrt(3 / ((2 + 4) / 2)) = 1
        assert!(first.iter().all(|v| v.abs() <= 1.0));
        let expected = [-0.15587044f32, -0.035012603, 0.3388028, 0.17945755];
        let actual: Vec<f32> = first.iter().copied().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_variance_scaling_family_is_deterministic() {
        let family = [
            Initializer::glorot_normal(),
            Initializer::he_normal(),
            Initializer::he_uniform(),
            Initializer::LeCunNormal { seed: DEFAULT_SEED },
            Initializer::LeCunUniform { seed: DEFAULT_SEED },
            Initializer::variance_scaling(1.0, FanMode::FanOut, Distribution::UntruncatedNormal, DEFAULT_SEED).unwrap(),
        ];
        for init in family {
            let a = init.initialize(2, 4, &[2, 2]).unwrap();
            let b = init.initialize(2, 4, &[2, 2]).unwrap();
            assert_eq!(a, b, "{} is not reproducible", init);
        }
    }

    #[test]
    fn test_truncated_normal_stays_within_two_stddev() {
        let init = Initializer::truncated_normal(1.0, 0.5, 7).unwrap();
        let values = init.initialize(0, 0, &[50, 20]).unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn test_he_normal_truncation_bound() {
        // stddev = sqrt(2 / 8) / 0.8796..., samples within two of them
        let bound = 2.0 * (0.25f64.sqrt() / TRUNCATION_CORRECTION) as f32;
        let values = Initializer::he_normal().initialize(8, 3, &[8, 3]).unwrap();
        assert!(values.iter().all(|v| v.abs() <= bound + 1e-6));
    }

    #[test]
    fn test_invalid_hyperparameters_are_rejected() {
        assert!(matches!(
            Initializer::variance_scaling(0.0, FanMode::FanIn, Distribution::Uniform, 1),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(Initializer::random_uniform(1.0, 0.0, 1), Err(Error::Configuration(_))));
        assert!(matches!(Initializer::random_normal(0.0, -1.0, 1), Err(Error::Configuration(_))));
        assert!(matches!(
            Initializer::Identity { gain: 1.0 }.initialize(1, 1, &[2, 2, 2]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_random_uniform_without_shift() {
        let values = Initializer::random_uniform(0.0, 2.0, 3).unwrap().initialize(1, 1, &[100]).unwrap();
        assert!(values.iter().all(|&v| (0.0..2.0).contains(&v)));
        let fixed = Initializer::random_uniform(5.0, 5.0, 3).unwrap().initialize(1, 1, &[4]).unwrap();
        assert!(fixed.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_identity_and_constants() {
        let eye = Initializer::Identity { gain: 2.0 }.initialize(3, 2, &[3, 2]).unwrap();
        assert_eq!(eye[[0, 0]], 2.0);
        assert_eq!(eye[[1, 1]], 2.0);
        assert_eq!(eye[[2, 0]], 0.0);
        assert!(Initializer::constant(0.5).initialize(0, 0, &[3]).unwrap().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_serde_round_trip() {
        let init = Initializer::HeUniform { seed: 4 };
        let json = serde_json::to_string(&init).unwrap();
        assert_eq!(serde_json::from_str::<Initializer>(&json).unwrap(), init);
    }
}

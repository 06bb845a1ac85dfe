//! Numeric sample generators.
//!
//! A generator maps a uniform sample `u` in `(0, 1]` to a value. The caller
//! owns the random source, so a generator is a pure function and can be
//! shared by any number of connections.
//!
//! ## Distribution Strings
//!
//! ```text
//! 200                      fixed value
//! fixed:200                fixed value
//! uniform:1000             uniform in [0, 1000)
//! exponential:5000         exponential with rate 5000
//! pareto:LOC,SCALE,SHAPE   generalized pareto
//! gev:LOC,SCALE,SHAPE      generalized extreme value
//! fb_key | fb_value | fb_ia
//! ```

use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a distribution string.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeneratorError {
    #[error("unknown distribution '{0}'")]
    UnknownDistribution(String),
    #[error("invalid parameter '{param}' in distribution '{spec}'")]
    InvalidParameter { spec: String, param: String },
    #[error("distribution '{spec}' expects {expected} parameter(s)")]
    WrongArity { spec: String, expected: usize },
}

/// Source of numeric workload samples (key size, value size, inter-arrival).
pub trait Generator {
    /// Map a uniform sample in `(0, 1]` to a value.
    fn generate(&self, u: f64) -> f64;
}

/// Closed set of supported distributions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Fixed(f64),
    Uniform(f64),
    Exponential { lambda: f64 },
    Pareto { loc: f64, scale: f64, shape: f64 },
    Gev { loc: f64, scale: f64, shape: f64 },
}

impl Distribution {
    /// Key sizes observed in the ETC workload.
    pub fn facebook_key() -> Self {
        Distribution::Gev {
            loc: 30.7984,
            scale: 8.20449,
            shape: 0.078688,
        }
    }

    /// Value sizes observed in the ETC workload.
    pub fn facebook_value() -> Self {
        Distribution::Pareto {
            loc: 15.0,
            scale: 214.476,
            shape: 0.348238,
        }
    }

    /// Inter-arrival gaps (seconds) observed in the ETC workload.
    pub fn facebook_ia() -> Self {
        Distribution::Pareto {
            loc: 0.0,
            scale: 16.0292e-6,
            shape: 0.154971,
        }
    }

    /// Build an inter-arrival generator for a per-connection request rate.
    ///
    /// Parameterless specs (`exponential`, `fixed`, `uniform`) are derived
    /// from `lambda`. A `lambda` of zero means "no pacing" and always
    /// produces a zero delay.
    pub fn interarrival(spec: &str, lambda: f64) -> Result<Self, GeneratorError> {
        if lambda <= 0.0 {
            // Validate the string anyway so typos fail at startup.
            if !matches!(spec.trim(), "exponential" | "fixed" | "uniform") {
                spec.parse::<Distribution>()?;
            }
            return Ok(Distribution::Fixed(0.0));
        }

        match spec.trim() {
            "exponential" => Ok(Distribution::Exponential { lambda }),
            "fixed" => Ok(Distribution::Fixed(1.0 / lambda)),
            "uniform" => Ok(Distribution::Uniform(2.0 / lambda)),
            other => other.parse(),
        }
    }
}

impl Generator for Distribution {
    fn generate(&self, u: f64) -> f64 {
        // ln(0) is -inf; keep the sample strictly positive.
        let u = u.clamp(f64::MIN_POSITIVE, 1.0);
        match *self {
            Distribution::Fixed(value) => value,
            Distribution::Uniform(scale) => u * scale,
            Distribution::Exponential { lambda } => {
                if lambda <= 0.0 {
                    0.0
                } else {
                    -u.ln() / lambda
                }
            }
            Distribution::Pareto { loc, scale, shape } => {
                if shape == 0.0 {
                    loc - scale * u.ln()
                } else {
                    loc + scale * (u.powf(-shape) - 1.0) / shape
                }
            }
            Distribution::Gev { loc, scale, shape } => {
                if shape == 0.0 {
                    loc - scale * (-u.ln()).ln()
                } else {
                    loc + scale * ((-u.ln()).powf(-shape) - 1.0) / shape
                }
            }
        }
    }
}

impl FromStr for Distribution {
    type Err = GeneratorError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();

        if let Ok(value) = spec.parse::<f64>() {
            return Ok(Distribution::Fixed(value));
        }

        let (name, args) = match spec.split_once(':') {
            Some((name, args)) => (name, args),
            None => (spec, ""),
        };

        let params = parse_params(spec, args)?;

        match name.to_lowercase().as_str() {
            "fb_key" => Ok(Distribution::facebook_key()),
            "fb_value" => Ok(Distribution::facebook_value()),
            "fb_ia" => Ok(Distribution::facebook_ia()),
            "fixed" => {
                let [value] = take::<1>(spec, &params)?;
                Ok(Distribution::Fixed(value))
            }
            "uniform" => {
                let [scale] = take::<1>(spec, &params)?;
                Ok(Distribution::Uniform(scale))
            }
            "exponential" => {
                let [lambda] = take::<1>(spec, &params)?;
                Ok(Distribution::Exponential { lambda })
            }
            "pareto" => {
                let [loc, scale, shape] = take::<3>(spec, &params)?;
                Ok(Distribution::Pareto { loc, scale, shape })
            }
            "gev" => {
                let [loc, scale, shape] = take::<3>(spec, &params)?;
                Ok(Distribution::Gev { loc, scale, shape })
            }
            _ => Err(GeneratorError::UnknownDistribution(spec.to_string())),
        }
    }
}

fn parse_params(spec: &str, args: &str) -> Result<Vec<f64>, GeneratorError> {
    if args.is_empty() {
        return Ok(Vec::new());
    }

    args.split(',')
        .map(|param| {
            param
                .trim()
                .parse::<f64>()
                .map_err(|_| GeneratorError::InvalidParameter {
                    spec: spec.to_string(),
                    param: param.to_string(),
                })
        })
        .collect()
}

fn take<const N: usize>(spec: &str, params: &[f64]) -> Result<[f64; N], GeneratorError> {
    params.try_into().map_err(|_| GeneratorError::WrongArity {
        spec: spec.to_string(),
        expected: N,
    })
}

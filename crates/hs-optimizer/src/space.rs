//! Search space definitions and parameter sweep strategies.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hs_types::{
    space_error, validate_specs, HsResult, ParameterDomain, ParameterSet, ParameterSpec,
    ParameterValue,
};

/// Points per continuous dimension when a grid has to discretize it.
pub const DEFAULT_GRID_STEPS: usize = 5;

/// How parameter sets are drawn from the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SamplingMode {
    /// Exhaustive Cartesian product in declaration order.
    Grid {
        #[serde(default = "default_grid_steps")]
        grid_steps: usize,
    },
    /// Independent draws per dimension. Reproducible only with a seed.
    Random {
        #[serde(default)]
        seed: Option<u64>,
    },
}

fn default_grid_steps() -> usize {
    DEFAULT_GRID_STEPS
}

/// Serialized form of a parameter space, validated by [`SpaceConfig::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub sampling: SamplingMode,
    pub parameters: Vec<ParameterSpec>,
}

impl SpaceConfig {
    pub fn build(self) -> HsResult<ParameterSpace> {
        ParameterSpace::new(self.parameters, self.sampling)
    }
}

/// Notice that a grid was larger than the trial budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    /// Size of the full grid.
    pub available: usize,
    /// Number of grid points actually used.
    pub used: usize,
}

/// Result of drawing parameter sets for one search.
#[derive(Debug, Clone, PartialEq)]
pub struct Sampling {
    pub sets: Vec<ParameterSet>,
    pub truncation: Option<Truncation>,
}

/// The full search space: ordered dimensions plus a sampling mode.
/// Validated at construction, so sampling never fails on a bad domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    parameters: Vec<ParameterSpec>,
    mode: SamplingMode,
}

impl ParameterSpace {
    pub fn new(parameters: Vec<ParameterSpec>, mode: SamplingMode) -> HsResult<Self> {
        validate_specs(&parameters)?;

        if let SamplingMode::Grid { grid_steps } = mode {
            if grid_steps < 2 {
                return Err(space_error!("grid_steps must be >= 2, got {grid_steps}"));
            }
            for spec in &parameters {
                match &spec.domain {
                    ParameterDomain::Normal { .. } => {
                        return Err(space_error!(
                            "'{}': normal distributions cannot be grid sampled",
                            spec.name
                        ));
                    }
                    ParameterDomain::Choice { values } => {
                        for (i, value) in values.iter().enumerate() {
                            if values[..i].contains(value) {
                                return Err(space_error!(
                                    "'{}': duplicate grid value {value}",
                                    spec.name
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self { parameters, mode })
    }

    pub fn grid(parameters: Vec<ParameterSpec>) -> HsResult<Self> {
        Self::new(
            parameters,
            SamplingMode::Grid {
                grid_steps: DEFAULT_GRID_STEPS,
            },
        )
    }

    pub fn random(parameters: Vec<ParameterSpec>, seed: Option<u64>) -> HsResult<Self> {
        Self::new(parameters, SamplingMode::Random { seed })
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn mode(&self) -> &SamplingMode {
        &self.mode
    }

    /// Total number of grid points, `None` for random spaces or a product
    /// that overflows.
    pub fn grid_size(&self) -> Option<usize> {
        match self.mode {
            SamplingMode::Grid { grid_steps } => self
                .parameters
                .iter()
                .try_fold(1usize, |total, spec| {
                    total.checked_mul(axis_len(&spec.domain, grid_steps))
                }),
            SamplingMode::Random { .. } => None,
        }
    }

    /// Fresh strategy over this space.
    pub fn strategy(&self) -> Box<dyn SearchStrategy> {
        match self.mode {
            SamplingMode::Grid { grid_steps } => {
                Box::new(GridSearch::new(self.parameters.clone(), grid_steps))
            }
            SamplingMode::Random { seed } => {
                Box::new(RandomSearch::new(self.parameters.clone(), seed))
            }
        }
    }

    /// Draw up to `max_trials` parameter sets. Grids larger than the budget
    /// are cut to their first `max_trials` points in enumeration order.
    pub fn sample(&self, max_trials: usize) -> Sampling {
        let mut strategy = self.strategy();
        let sets = strategy.suggest(max_trials);

        let truncation = match self.grid_size() {
            Some(available) if available > max_trials => Some(Truncation {
                available,
                used: sets.len(),
            }),
            // An overflowing grid is certainly larger than any budget.
            None if matches!(self.mode, SamplingMode::Grid { .. }) => Some(Truncation {
                available: usize::MAX,
                used: sets.len(),
            }),
            _ => None,
        };

        debug!(
            strategy = strategy.name(),
            drawn = sets.len(),
            truncated = truncation.is_some(),
            "sampled parameter sets"
        );

        Sampling { sets, truncation }
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy: Send + Sync {
    /// Generate the next batch of parameter combinations to evaluate.
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Number of grid values along one dimension. Ranges too wide to count are
/// capped at `usize::MAX`; the cursor never gets that far.
fn axis_len(domain: &ParameterDomain, grid_steps: usize) -> usize {
    match domain {
        d if d.is_discrete() => d.cardinality().unwrap_or(usize::MAX),
        ParameterDomain::Uniform { low, high } | ParameterDomain::LogUniform { low, high }
            if low == high =>
        {
            1
        }
        ParameterDomain::Uniform { .. } | ParameterDomain::LogUniform { .. } => grid_steps.max(2),
        // Rejected when the space is built.
        _ => 0,
    }
}

/// One grid dimension. Integer and quantized axes decode values from the
/// index, so their width costs nothing.
#[derive(Debug, Clone)]
enum Axis {
    Values(Vec<ParameterValue>),
    Ints { low: i64, len: usize },
    Multiples { first: i64, q: f64, len: usize },
}

impl Axis {
    fn new(domain: &ParameterDomain, grid_steps: usize) -> Self {
        let len = axis_len(domain, grid_steps);
        let spaced = |low: f64, high: f64| -> Vec<f64> {
            if len < 2 {
                return vec![low; len];
            }
            (0..len)
                .map(|i| low + (i as f64 / (len - 1) as f64) * (high - low))
                .collect()
        };
        match domain {
            ParameterDomain::Choice { values } => Axis::Values(values.clone()),
            ParameterDomain::IntRange { low, .. } => Axis::Ints { low: *low, len },
            ParameterDomain::QUniform { q, .. } => {
                let (first, _) = domain.quantized_bounds().unwrap_or_default();
                Axis::Multiples { first, q: *q, len }
            }
            ParameterDomain::Uniform { low, high } => Axis::Values(
                spaced(*low, *high)
                    .into_iter()
                    .map(ParameterValue::Float)
                    .collect(),
            ),
            ParameterDomain::LogUniform { low, high } => Axis::Values(
                spaced(low.ln(), high.ln())
                    .into_iter()
                    .map(|v| ParameterValue::Float(v.exp()))
                    .collect(),
            ),
            ParameterDomain::Normal { .. } => Axis::Values(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Axis::Values(values) => values.len(),
            Axis::Ints { len, .. } | Axis::Multiples { len, .. } => *len,
        }
    }

    /// Value at `index`, which must be below `len()`. Wrapping add keeps
    /// ranges wider than `i64::MAX` exact.
    fn value(&self, index: usize) -> ParameterValue {
        match self {
            Axis::Values(values) => values[index].clone(),
            Axis::Ints { low, .. } => ParameterValue::Int(low.wrapping_add(index as i64)),
            Axis::Multiples { first, q, .. } => {
                ParameterValue::Float(first.wrapping_add(index as i64) as f64 * q)
            }
        }
    }
}

/// Exhaustive grid search over discrete parameter combinations.
///
/// Points are decoded from a cursor on demand, so large grids are never
/// materialized. Enumeration is lexicographic over value indices with the
/// last declared dimension varying fastest.
#[derive(Debug, Clone)]
pub struct GridSearch {
    names: Vec<String>,
    axes: Vec<Axis>,
    cursor: usize,
    total: Option<usize>,
}

impl GridSearch {
    pub fn new(parameters: Vec<ParameterSpec>, grid_steps: usize) -> Self {
        let axes: Vec<Axis> = parameters
            .iter()
            .map(|param| Axis::new(&param.domain, grid_steps))
            .collect();
        let total = axes
            .iter()
            .try_fold(1usize, |total, axis| total.checked_mul(axis.len()));
        Self {
            names: parameters.into_iter().map(|p| p.name).collect(),
            axes,
            cursor: 0,
            total,
        }
    }

    /// Grid point at `index`.
    fn point(&self, mut index: usize) -> ParameterSet {
        let mut values = vec![ParameterValue::Int(0); self.axes.len()];
        for (slot, axis) in values.iter_mut().zip(&self.axes).rev() {
            *slot = axis.value(index % axis.len());
            index /= axis.len();
        }
        ParameterSet::from_pairs(self.names.iter().cloned().zip(values))
    }

    /// Points not yet handed out.
    pub fn remaining(&self) -> Option<usize> {
        self.total.map(|total| total - self.cursor)
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet> {
        // An overflowing product is larger than any count we can be asked for.
        let total = self.total.unwrap_or(usize::MAX);
        let end = self.cursor.saturating_add(count).min(total);
        let batch = (self.cursor..end).map(|i| self.point(i)).collect();
        self.cursor = end;
        batch
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    parameters: Vec<ParameterSpec>,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(parameters: Vec<ParameterSpec>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { parameters, rng }
    }

    fn sample_one(&mut self) -> ParameterSet {
        let rng = &mut self.rng;
        let values: Vec<(String, ParameterValue)> = self
            .parameters
            .iter()
            .map(|param| (param.name.clone(), sample_domain(&param.domain, rng)))
            .collect();
        ParameterSet::from_pairs(values)
    }
}

fn sample_domain(domain: &ParameterDomain, rng: &mut ChaCha8Rng) -> ParameterValue {
    match domain {
        ParameterDomain::Choice { values } => {
            let idx = rng.gen_range(0..values.len());
            values[idx].clone()
        }
        ParameterDomain::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterDomain::Uniform { low, high } => {
            ParameterValue::Float(rng.gen_range(*low..=*high))
        }
        ParameterDomain::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp())
        }
        ParameterDomain::QUniform { low, high, q } => {
            let raw: f64 = rng.gen_range(*low..=*high);
            let mut k = (raw / q).round() as i64;
            // Rounding can step past either bound.
            if let Some((first, last)) = domain.quantized_bounds() {
                k = k.max(first).min(last);
            }
            ParameterValue::Float(k as f64 * q)
        }
        ParameterDomain::Normal { mean, std_dev } => {
            // Box-Muller; 1 - u keeps the log argument in (0, 1].
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen::<f64>();
            let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            ParameterValue::Float(mean + std_dev * z)
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{ConfigError, HsError};

    fn regularization() -> ParameterSpec {
        ParameterSpec::choice("regularization", vec![0.001, 0.005, 0.01, 0.05, 0.1, 1.0])
    }

    fn sample_specs() -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("depth", ParameterDomain::IntRange { low: 5, high: 15 }),
            ParameterSpec::new(
                "subsample",
                ParameterDomain::Uniform {
                    low: 0.5,
                    high: 1.0,
                },
            ),
            ParameterSpec::new(
                "lr",
                ParameterDomain::LogUniform {
                    low: 1e-5,
                    high: 1e-1,
                },
            ),
            ParameterSpec::choice("solver", vec!["lbfgs", "saga"]),
        ]
    }

    #[test]
    fn single_dimension_grid_in_declared_order() {
        let space = ParameterSpace::grid(vec![regularization()]).unwrap();
        let sampling = space.sample(100);

        let values: Vec<f64> = sampling
            .sets
            .iter()
            .map(|set| set.get_f64("regularization").unwrap())
            .collect();
        assert_eq!(values, vec![0.001, 0.005, 0.01, 0.05, 0.1, 1.0]);
        assert!(sampling.truncation.is_none());
    }

    #[test]
    fn grid_is_cartesian_product_with_last_dimension_fastest() {
        let space = ParameterSpace::grid(vec![
            ParameterSpec::new("a", ParameterDomain::IntRange { low: 1, high: 3 }),
            ParameterSpec::choice("b", vec!["x", "y"]),
            ParameterSpec::choice("c", vec![true, false]),
        ])
        .unwrap();
        assert_eq!(space.grid_size(), Some(12));

        let sets = space.sample(100).sets;
        assert_eq!(sets.len(), 12);
        for (i, a) in sets.iter().enumerate() {
            for b in &sets[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(sets[0].to_string(), "a=1, b=x, c=true");
        assert_eq!(sets[1].to_string(), "a=1, b=x, c=false");
        assert_eq!(sets[2].to_string(), "a=1, b=y, c=true");
        assert_eq!(sets[11].to_string(), "a=3, b=y, c=false");
    }

    #[test]
    fn grid_truncates_to_budget() {
        let space = ParameterSpace::grid(vec![regularization()]).unwrap();
        let sampling = space.sample(4);
        assert_eq!(sampling.sets.len(), 4);
        assert_eq!(
            sampling.truncation,
            Some(Truncation {
                available: 6,
                used: 4
            })
        );
        assert_eq!(sampling.sets[3].get_f64("regularization"), Some(0.05));
    }

    #[test]
    fn grid_cursor_advances() {
        let specs = vec![ParameterSpec::new(
            "x",
            ParameterDomain::IntRange { low: 1, high: 5 },
        )];
        let mut gs = GridSearch::new(specs, DEFAULT_GRID_STEPS);
        assert_eq!(gs.suggest(3).len(), 3);
        assert_eq!(gs.remaining(), Some(2));
        assert_eq!(gs.suggest(10).len(), 2);
        assert!(gs.suggest(1).is_empty());
    }

    #[test]
    fn wide_integer_range_is_decoded_lazily() {
        let space = ParameterSpace::grid(vec![
            ParameterSpec::new(
                "seed",
                ParameterDomain::IntRange {
                    low: 0,
                    high: 10_000_000_000,
                },
            ),
            ParameterSpec::choice("solver", vec!["lbfgs", "saga"]),
        ])
        .unwrap();
        assert_eq!(space.grid_size(), Some(20_000_000_002));

        let sampling = space.sample(6);
        assert_eq!(sampling.sets.len(), 6);
        assert_eq!(
            sampling.truncation,
            Some(Truncation {
                available: 20_000_000_002,
                used: 6
            })
        );
        assert_eq!(sampling.sets[0].to_string(), "seed=0, solver=lbfgs");
        assert_eq!(sampling.sets[5].to_string(), "seed=2, solver=saga");
    }

    #[test]
    fn full_integer_range_is_reported_as_overflowing() {
        let space = ParameterSpace::grid(vec![ParameterSpec::new(
            "offset",
            ParameterDomain::IntRange {
                low: i64::MIN,
                high: i64::MAX,
            },
        )])
        .unwrap();
        let sampling = space.sample(3);
        let values: Vec<Option<&ParameterValue>> =
            sampling.sets.iter().map(|set| set.get("offset")).collect();
        assert_eq!(
            values,
            vec![
                Some(&ParameterValue::Int(i64::MIN)),
                Some(&ParameterValue::Int(i64::MIN + 1)),
                Some(&ParameterValue::Int(i64::MIN + 2)),
            ]
        );
        assert!(sampling.truncation.is_some());
    }

    #[test]
    fn grid_discretizes_continuous_ranges() {
        let space = ParameterSpace::new(
            vec![
                ParameterSpec::new(
                    "subsample",
                    ParameterDomain::Uniform {
                        low: 0.0,
                        high: 1.0,
                    },
                ),
                ParameterSpec::new(
                    "step",
                    ParameterDomain::QUniform {
                        low: 0.0,
                        high: 1.0,
                        q: 0.25,
                    },
                ),
            ],
            SamplingMode::Grid { grid_steps: 3 },
        )
        .unwrap();
        assert_eq!(space.grid_size(), Some(15));
        let first = &space.sample(15).sets;
        assert_eq!(first[0].get_f64("subsample"), Some(0.0));
        assert_eq!(first[5].get_f64("subsample"), Some(0.5));
        assert_eq!(first[4].get_f64("step"), Some(1.0));
    }

    #[test]
    fn grid_rejects_normal_and_duplicate_values() {
        let normal = ParameterSpec::new(
            "noise",
            ParameterDomain::Normal {
                mean: 0.0,
                std_dev: 1.0,
            },
        );
        assert!(ParameterSpace::grid(vec![normal.clone()]).is_err());
        assert!(ParameterSpace::random(vec![normal], Some(1)).is_ok());

        let dupes = ParameterSpec::choice("x", vec![1i64, 1]);
        assert!(ParameterSpace::grid(vec![dupes]).is_err());
    }

    #[test]
    fn empty_domain_fails_at_construction() {
        let err = ParameterSpace::grid(vec![ParameterSpec::choice("x", Vec::<f64>::new())]);
        assert!(matches!(
            err,
            Err(HsError::Config(ConfigError::EmptyDomain { .. }))
        ));
        let err = ParameterSpace::random(
            vec![ParameterSpec::new(
                "n",
                ParameterDomain::IntRange { low: 2, high: 1 },
            )],
            None,
        );
        assert!(err.is_err());

        // No multiple of 0.25 lies in [0.1, 0.2].
        let no_multiple = ParameterSpec::new(
            "dropout",
            ParameterDomain::QUniform {
                low: 0.1,
                high: 0.2,
                q: 0.25,
            },
        );
        for built in [
            ParameterSpace::grid(vec![no_multiple.clone()]),
            ParameterSpace::random(vec![no_multiple], Some(3)),
        ] {
            assert!(matches!(
                built,
                Err(HsError::Config(ConfigError::EmptyDomain { .. }))
            ));
        }
    }

    #[test]
    fn quniform_draws_stay_inside_bounds() {
        let spec = ParameterSpec::new(
            "dropout",
            ParameterDomain::QUniform {
                low: 0.3,
                high: 0.9,
                q: 0.25,
            },
        );
        let mut rs = RandomSearch::new(vec![spec.clone()], Some(11));
        for params in rs.suggest(300) {
            let dropout = params.get_f64("dropout").unwrap();
            assert!(dropout == 0.5 || dropout == 0.75, "unexpected draw: {dropout}");
        }

        let grid = ParameterSpace::grid(vec![spec]).unwrap();
        assert_eq!(grid.grid_size(), Some(2));
        let values: Vec<f64> = grid
            .sample(10)
            .sets
            .iter()
            .map(|set| set.get_f64("dropout").unwrap())
            .collect();
        assert_eq!(values, vec![0.5, 0.75]);
    }

    #[test]
    fn random_search_respects_bounds() {
        let mut rs = RandomSearch::new(sample_specs(), None);
        let suggestions = rs.suggest(200);
        assert_eq!(suggestions.len(), 200);

        for params in &suggestions {
            match params.get("depth") {
                Some(ParameterValue::Int(v)) => assert!((5..=15).contains(v)),
                other => panic!("unexpected depth value: {other:?}"),
            }
            let subsample = params.get_f64("subsample").unwrap();
            assert!((0.5..=1.0).contains(&subsample));
            let lr = params.get_f64("lr").unwrap();
            assert!((1e-5..=1e-1).contains(&lr), "lr out of bounds: {lr}");
            match params.get("solver") {
                Some(ParameterValue::Text(s)) => assert!(s == "lbfgs" || s == "saga"),
                other => panic!("unexpected solver value: {other:?}"),
            }
        }
    }

    #[test]
    fn seeded_random_sampling_is_reproducible() {
        let space = ParameterSpace::random(sample_specs(), Some(42)).unwrap();
        let first = space.sample(25);
        let second = space.sample(25);
        assert_eq!(first.sets, second.sets);
        assert!(first.truncation.is_none());
    }

    #[test]
    fn unseeded_random_sampling_differs_between_runs() {
        let space = ParameterSpace::random(sample_specs(), None).unwrap();
        assert_ne!(space.sample(25).sets, space.sample(25).sets);
    }

    #[test]
    fn quniform_and_normal_draws() {
        let specs = vec![
            ParameterSpec::new(
                "batch",
                ParameterDomain::QUniform {
                    low: 16.0,
                    high: 128.0,
                    q: 16.0,
                },
            ),
            ParameterSpec::new(
                "noise",
                ParameterDomain::Normal {
                    mean: 10.0,
                    std_dev: 0.5,
                },
            ),
        ];
        let mut rs = RandomSearch::new(specs, Some(7));
        let draws = rs.suggest(500);
        let mut noise_sum = 0.0;
        for params in &draws {
            let batch = params.get_f64("batch").unwrap();
            assert_eq!(batch % 16.0, 0.0);
            noise_sum += params.get_f64("noise").unwrap();
        }
        let mean = noise_sum / draws.len() as f64;
        assert!((mean - 10.0).abs() < 0.2, "sample mean drifted: {mean}");
    }

    #[test]
    fn space_config_round_trips_from_json() {
        let json = r#"{
            "sampling": {"type": "grid"},
            "parameters": [
                {"name": "regularization", "domain": {"type": "choice", "values": [0.001, 0.005, 0.01, 0.05, 0.1, 1.0]}}
            ]
        }"#;
        let config: SpaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.sampling,
            SamplingMode::Grid {
                grid_steps: DEFAULT_GRID_STEPS
            }
        );
        let space = config.build().unwrap();
        assert_eq!(space.grid_size(), Some(6));
    }
}

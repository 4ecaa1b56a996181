use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use nalgebra::{DVector, RealField, Scalar, SimdRealField, convert};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::{DeepcError, DeepcResult};
use crate::program::Variant;

// Centres and spreads of the random initialisation
const DEFAULT_Q: f64 = 100.0;
const DEFAULT_Q_SPREAD: f64 = 0.01;
const DEFAULT_R: f64 = 0.01;
const DEFAULT_R_SPREAD: f64 = 0.001;
const DEFAULT_LAM: f64 = 200.0;
const DEFAULT_LAM_Y_SPREAD: f64 = 0.001;
const DEFAULT_LAM_U_SPREAD: f64 = 0.01;
const DEFAULT_LAM_G1_SPREAD: f64 = 0.0001;
const DEFAULT_LAM_G2_SPREAD: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamName {
    Q,
    R,
    LamY,
    LamU,
    LamG1,
    LamG2,
}

impl ParamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::Q => "q",
            ParamName::R => "r",
            ParamName::LamY => "lam_y",
            ParamName::LamU => "lam_u",
            ParamName::LamG1 => "lam_g1",
            ParamName::LamG2 => "lam_g2",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A learnable value with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnableParam<F> {
    pub value: DVector<F>,
    pub grad: DVector<F>,
}

impl<F> LearnableParam<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn new(value: DVector<F>) -> Self {
        let grad = DVector::zeros(value.len());
        Self { value, grad }
    }
}

/// Starting values for the learnable parameters.
///
/// Anything left as `None` is drawn around the defaults (q≈100, r≈0.01,
/// λ≈200) with a small uniform jitter from a generator seeded with `seed`.
#[derive(Debug, Clone)]
pub struct InitialWeights<F> {
    pub q: Option<DVector<F>>,
    pub r: Option<DVector<F>>,
    pub lam_y: Option<F>,
    pub lam_u: Option<F>,
    pub lam_g1: Option<F>,
    pub lam_g2: Option<F>,
    pub seed: u64,
}

impl<F> Default for InitialWeights<F> {
    fn default() -> Self {
        Self {
            q: None,
            r: None,
            lam_y: None,
            lam_u: None,
            lam_g1: None,
            lam_g2: None,
            seed: 0,
        }
    }
}

impl<F> InitialWeights<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn random(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    pub fn new(q: DVector<F>, r: DVector<F>) -> Self {
        Self {
            q: Some(q),
            r: Some(r),
            ..Default::default()
        }
    }

    pub fn with_lam_y(mut self, v: F) -> Self {
        self.lam_y = Some(v);
        self
    }

    pub fn with_lam_u(mut self, v: F) -> Self {
        self.lam_u = Some(v);
        self
    }

    pub fn with_lam_g1(mut self, v: F) -> Self {
        self.lam_g1 = Some(v);
        self
    }

    pub fn with_lam_g2(mut self, v: F) -> Self {
        self.lam_g2 = Some(v);
        self
    }
}

/// Name → value + gradient for every parameter active in one controller variant.
#[derive(Debug, Clone)]
pub struct ParameterStore<F> {
    entries: BTreeMap<ParamName, LearnableParam<F>>,
}

impl<F> Default for ParameterStore<F> {
    fn default() -> Self {
        Self { entries: BTreeMap::new() }
    }
}

fn jittered<F>(rng: &mut StdRng, len: usize, centre: f64, spread: f64) -> DVector<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    DVector::from_fn(len, |_, _| convert(centre + spread * rng.random_range(-1.0..1.0)))
}

impl<F> ParameterStore<F>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    pub fn for_variant(variant: Variant, p: usize, m: usize, weights: &InitialWeights<F>) -> DeepcResult<Self> {
        let mut rng = StdRng::seed_from_u64(weights.seed);
        let mut store = Self::default();

        let q = weights.q.clone().unwrap_or_else(|| jittered(&mut rng, p, DEFAULT_Q, DEFAULT_Q_SPREAD));
        let r = weights.r.clone().unwrap_or_else(|| jittered(&mut rng, m, DEFAULT_R, DEFAULT_R_SPREAD));
        if q.len() != p {
            return Err(DeepcError::Configuration(format!("q has {} entries for {p} outputs", q.len())));
        }
        if r.len() != m {
            return Err(DeepcError::Configuration(format!("r has {} entries for {m} inputs", r.len())));
        }
        store.insert(ParamName::Q, q)?;
        store.insert(ParamName::R, r)?;

        let mut scalar = |name, given: Option<F>, spread| {
            let v = given.unwrap_or_else(|| jittered::<F>(&mut rng, 1, DEFAULT_LAM, spread)[0]);
            store.insert(name, DVector::from_element(1, v))
        };
        if variant.stochastic_y {
            scalar(ParamName::LamY, weights.lam_y, DEFAULT_LAM_Y_SPREAD)?;
        }
        if variant.stochastic_u {
            scalar(ParamName::LamU, weights.lam_u, DEFAULT_LAM_U_SPREAD)?;
        }
        if variant.nonlinear {
            scalar(ParamName::LamG1, weights.lam_g1, DEFAULT_LAM_G1_SPREAD)?;
            scalar(ParamName::LamG2, weights.lam_g2, DEFAULT_LAM_G2_SPREAD)?;
        }

        debug!("Parameter store: {:?}", store.names());
        Ok(store)
    }

    fn insert(&mut self, name: ParamName, value: DVector<F>) -> DeepcResult<()> {
        check_value(name, &value)?;
        self.entries.insert(name, LearnableParam::new(value));
        Ok(())
    }

    pub fn contains(&self, name: ParamName) -> bool {
        self.entries.contains_key(&name)
    }

    pub fn names(&self) -> Vec<ParamName> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, name: ParamName) -> Option<&LearnableParam<F>> {
        self.entries.get(&name)
    }

    pub fn value(&self, name: ParamName) -> Option<&DVector<F>> {
        self.entries.get(&name).map(|p| &p.value)
    }

    pub fn grad(&self, name: ParamName) -> Option<&DVector<F>> {
        self.entries.get(&name).map(|p| &p.grad)
    }

    /// The scalar value of a regulariser, if it is active.
    pub fn scalar(&self, name: ParamName) -> Option<F> {
        self.value(name).map(|v| v[0])
    }

    /// Overwrites an active parameter. Values must keep their length and stay non-negative.
    pub fn set(&mut self, name: ParamName, value: DVector<F>) -> DeepcResult<()> {
        let entry = self.entries.get_mut(&name).ok_or_else(|| DeepcError::InvalidParameter {
            name: name.as_str(),
            reason: "not active in this controller variant".into(),
        })?;
        if value.len() != entry.value.len() {
            return Err(DeepcError::shape(name.as_str(), (entry.value.len(), 1), (value.len(), 1)));
        }
        check_value(name, &value)?;
        entry.value = value;
        Ok(())
    }

    pub fn accumulate(&mut self, name: ParamName, grad: &DVector<F>) {
        if let Some(entry) = self.entries.get_mut(&name) {
            entry.grad += grad;
        }
    }

    pub fn zero_grad(&mut self) {
        for entry in self.entries.values_mut() {
            entry.grad.fill(convert(0.0));
        }
    }

    /// Clamps every value to at least `min_value`.
    pub fn project(&mut self, min_value: F) {
        for entry in self.entries.values_mut() {
            entry.value.apply(|v| *v = (*v).max(min_value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamName, &LearnableParam<F>)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamName, &mut LearnableParam<F>)> {
        self.entries.iter_mut().map(|(k, v)| (*k, v))
    }
}

fn check_value<F>(name: ParamName, value: &DVector<F>) -> DeepcResult<()>
where
    F: Scalar + Copy + SimdRealField + RealField,
{
    if value.iter().any(|v| !v.is_finite()) {
        return Err(DeepcError::InvalidParameter {
            name: name.as_str(),
            reason: "contains non-finite values".into(),
        });
    }
    if value.iter().any(|v| *v < convert(0.0)) {
        return Err(DeepcError::InvalidParameter {
            name: name.as_str(),
            reason: "must be non-negative".into(),
        });
    }
    Ok(())
}

//! Main denoising network contract
//!
//! The large denoising U-Net is an external collaborator: this crate only
//! needs something that maps `(x, t, kwargs)` to a noise estimate. Networks
//! are built by a [`NetworkFactory`] from a [`ModelProfile`] and a set of
//! [`TaggedWeights`].
//!
//! Guidance differentiates through the network with respect to its *input*.
//! Weights are constants for autograd except the sublayer roles declared
//! trainable in the [`GradientPolicy`] (attention qkv, normalization and
//! projection layers by default); those come back as gradient-tracking
//! [`Var`]s. Each parameter's role is declared by the factory at the call
//! site that loads it, so the trainable set is auditable through
//! [`ParameterRegistry`] instead of being inferred from parameter names.

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::VarBuilder;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::ModelProfile;

/// Keyword arguments forwarded to the main network on every call.
#[derive(Debug, Clone, Default)]
pub struct ModelKwargs {
    /// Class labels `(B,)` for class-conditional checkpoints.
    pub y: Option<Tensor>,
}

impl ModelKwargs {
    pub fn with_labels(y: Tensor) -> Self {
        Self { y: Some(y) }
    }
}

/// The main denoising network as an opaque callable.
pub trait DenoisingNetwork {
    /// `x: (B, C, H, W)`, `timesteps: (B,)` float network timesteps.
    /// Returns `(B, C, H, W)`, or `(B, 2C, H, W)` when the network also
    /// predicts its variance.
    fn forward(&self, x: &Tensor, timesteps: &Tensor, kwargs: &ModelKwargs) -> Result<Tensor>;

    /// Number of classes of a class-conditional network.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// Builds the main network for a checkpoint.
pub trait NetworkFactory {
    fn build(&self, profile: &ModelProfile, weights: TaggedWeights<'_>)
    -> Result<Arc<dyn DenoisingNetwork>>;
}

/// Role of a parameter within the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SublayerRole {
    /// Fused query/key/value projection of an attention block.
    AttentionQkv,
    /// Normalization scale and shift.
    Normalization,
    /// Output or input projections (attention out-proj, embedding projections).
    Projection,
    /// Everything else (convolutions, embeddings).
    Frozen,
}

impl fmt::Display for SublayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AttentionQkv => "attention-qkv",
            Self::Normalization => "normalization",
            Self::Projection => "projection",
            Self::Frozen => "frozen",
        };
        f.write_str(name)
    }
}

/// Which sublayer roles keep gradient tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientPolicy {
    trainable: Vec<SublayerRole>,
}

impl Default for GradientPolicy {
    fn default() -> Self {
        Self {
            trainable: vec![
                SublayerRole::AttentionQkv,
                SublayerRole::Normalization,
                SublayerRole::Projection,
            ],
        }
    }
}

impl GradientPolicy {
    pub fn new(trainable: Vec<SublayerRole>) -> Self {
        let trainable = trainable
            .into_iter()
            .filter(|r| *r != SublayerRole::Frozen)
            .collect();
        Self { trainable }
    }

    /// All parameters frozen.
    pub fn frozen() -> Self {
        Self {
            trainable: Vec::new(),
        }
    }

    pub fn is_trainable(&self, role: SublayerRole) -> bool {
        self.trainable.contains(&role)
    }

    pub fn trainable_roles(&self) -> &[SublayerRole] {
        &self.trainable
    }
}

/// One parameter loaded through [`TaggedWeights`].
#[derive(Debug, Clone)]
pub struct TaggedParameter {
    pub name: String,
    pub role: SublayerRole,
    pub trainable: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    params: Vec<TaggedParameter>,
    vars: Vec<Var>,
}

/// Record of every parameter loaded for a network and its gradient mode.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ParameterRegistry {
    fn record(&self, param: TaggedParameter, var: Option<Var>) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.params.push(param);
        if let Some(var) = var {
            inner.vars.push(var);
        }
    }

    pub fn parameters(&self) -> Vec<TaggedParameter> {
        match self.inner.lock() {
            Ok(guard) => guard.params.clone(),
            Err(poisoned) => poisoned.into_inner().params.clone(),
        }
    }

    /// Gradient-tracking parameters.
    pub fn trainable_vars(&self) -> Vec<Var> {
        match self.inner.lock() {
            Ok(guard) => guard.vars.clone(),
            Err(poisoned) => poisoned.into_inner().vars.clone(),
        }
    }

    pub fn trainable_names(&self) -> Vec<String> {
        self.parameters()
            .into_iter()
            .filter(|p| p.trainable)
            .map(|p| p.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.parameters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `VarBuilder` that requires a [`SublayerRole`] for every parameter.
#[derive(Clone)]
pub struct TaggedWeights<'a> {
    vb: VarBuilder<'a>,
    policy: GradientPolicy,
    registry: ParameterRegistry,
}

impl<'a> TaggedWeights<'a> {
    pub fn new(vb: VarBuilder<'a>, policy: GradientPolicy) -> Self {
        Self {
            vb,
            policy,
            registry: ParameterRegistry::default(),
        }
    }

    pub fn pp<S: ToString>(&self, s: S) -> Self {
        Self {
            vb: self.vb.pp(s),
            policy: self.policy.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.vb.dtype()
    }

    pub fn device(&self) -> &Device {
        self.vb.device()
    }

    pub fn policy(&self) -> &GradientPolicy {
        &self.policy
    }

    /// Shared registry of everything loaded through this builder and its
    /// children.
    pub fn registry(&self) -> ParameterRegistry {
        self.registry.clone()
    }

    /// Load `name` under the current prefix with the given role.
    pub fn get<S: Into<Shape>>(&self, shape: S, name: &str, role: SublayerRole) -> Result<Tensor> {
        let tensor = self.vb.get(shape, name)?;
        let full_name = self.full_name(name);
        if self.policy.is_trainable(role) {
            let var = Var::from_tensor(&tensor)?;
            let tracked = var.as_tensor().clone();
            self.registry.record(
                TaggedParameter {
                    name: full_name,
                    role,
                    trainable: true,
                },
                Some(var),
            );
            Ok(tracked)
        } else {
            self.registry.record(
                TaggedParameter {
                    name: full_name,
                    role,
                    trainable: false,
                },
                None,
            );
            Ok(tensor.detach())
        }
    }

    /// Load a frozen parameter.
    pub fn get_frozen<S: Into<Shape>>(&self, shape: S, name: &str) -> Result<Tensor> {
        self.get(shape, name, SublayerRole::Frozen)
    }

    fn full_name(&self, name: &str) -> String {
        let prefix = self.vb.prefix();
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn weights() -> Result<TaggedWeights<'static>> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("block.qkv.weight".to_string(), Tensor::ones((6, 2), DType::F32, &device)?);
        tensors.insert("block.norm.weight".to_string(), Tensor::ones((2,), DType::F32, &device)?);
        tensors.insert("block.conv.weight".to_string(), Tensor::ones((2, 2, 3, 3), DType::F32, &device)?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        Ok(TaggedWeights::new(vb, GradientPolicy::default()))
    }

    #[test]
    fn test_declared_roles_control_tracking() -> Result<()> {
        let tw = weights()?;
        let block = tw.pp("block");
        let qkv = block.get((6, 2), "qkv.weight", SublayerRole::AttentionQkv)?;
        let norm = block.get((2,), "norm.weight", SublayerRole::Normalization)?;
        let conv = block.get_frozen((2, 2, 3, 3), "conv.weight")?;

        assert!(qkv.is_variable());
        assert!(norm.is_variable());
        assert!(!conv.is_variable());

        let registry = tw.registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.trainable_names(),
            vec!["block.qkv.weight".to_string(), "block.norm.weight".to_string()]
        );
        assert_eq!(registry.trainable_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn test_frozen_policy_tracks_nothing() -> Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("qkv.weight".to_string(), Tensor::ones((6, 2), DType::F32, &device)?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let tw = TaggedWeights::new(vb, GradientPolicy::frozen());
        let qkv = tw.get((6, 2), "qkv.weight", SublayerRole::AttentionQkv)?;
        assert!(!qkv.is_variable());
        assert!(tw.registry().trainable_names().is_empty());
        Ok(())
    }

    #[test]
    fn test_frozen_role_is_never_trainable() {
        let policy = GradientPolicy::new(vec![SublayerRole::Frozen, SublayerRole::Projection]);
        assert!(!policy.is_trainable(SublayerRole::Frozen));
        assert!(policy.is_trainable(SublayerRole::Projection));
    }
}

//! Deployment steps and their argument sources.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, Specifier},
    json_abi::Function,
    primitives::{Address, Bytes, U256},
};
use serde::{Deserialize, Serialize};

use crate::{ContractRegistry, DeployError};

/// What a step does on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Deploy a contract; `args` are its constructor arguments.
    DeployPlain { artifact: String },
    /// Deploy an implementation behind an ERC-1967 proxy.
    ///
    /// `constructor_args` go to the implementation's constructor; `args` are
    /// passed to `initializer` through the proxy's constructor.
    DeployProxy {
        artifact: String,
        initializer: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        constructor_args: Vec<Arg>,
    },
    /// Call `function` on the registered component `target`.
    Invoke { target: String, function: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeployPlain { .. } => "deploy",
            Self::DeployProxy { .. } => "deploy-proxy",
            Self::Invoke { .. } => "invoke",
        }
    }

    pub fn artifact(&self) -> Option<&str> {
        match self {
            Self::DeployPlain { artifact } | Self::DeployProxy { artifact, .. } => Some(artifact),
            Self::Invoke { .. } => None,
        }
    }
}

/// One node of a chain's deployment graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Steps (or the components they produce) that must settle first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Arg>,
    /// Registry name of the deployed component. Defaults to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<String>,
}

impl DeploymentStep {
    fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: Vec::new(),
            args: Vec::new(),
            produces: None,
        }
    }

    pub fn deploy_plain(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::DeployPlain {
                artifact: artifact.into(),
            },
        )
    }

    pub fn deploy_proxy(
        name: impl Into<String>,
        artifact: impl Into<String>,
        initializer: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            StepKind::DeployProxy {
                artifact: artifact.into(),
                initializer: initializer.into(),
                constructor_args: Vec::new(),
            },
        )
    }

    pub fn invoke(
        name: impl Into<String>,
        target: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            StepKind::Invoke {
                target: target.into(),
                function: function.into(),
            },
        )
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn constructor_args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        if let StepKind::DeployProxy {
            constructor_args, ..
        } = &mut self.kind
        {
            constructor_args.extend(args);
        }
        self
    }

    /// Registry name written by this step. Invocations produce nothing.
    pub fn produces_name(&self) -> Option<&str> {
        match self.kind {
            StepKind::Invoke { .. } => None,
            _ => Some(self.produces.as_deref().unwrap_or(&self.name)),
        }
    }

    /// Registry name under which a proxy step keeps an implementation whose proxy
    /// has not been deployed yet.
    pub fn implementation_name(&self) -> Option<String> {
        match self.kind {
            StepKind::DeployProxy { .. } => self
                .produces_name()
                .map(|name| format!("{}.implementation", name)),
            _ => None,
        }
    }

    /// Whether a previous run already settled this step.
    pub fn is_settled(&self, registry: &ContractRegistry) -> bool {
        match self.produces_name() {
            Some(name) => registry.contains(name),
            None => registry.is_completed(&self.name),
        }
    }

    /// Check function signatures and arities without touching the registry.
    pub fn validate(&self) -> Result<(), DeployError> {
        match &self.kind {
            StepKind::DeployProxy { initializer, .. } => {
                parse_function(&self.name, initializer)?;
                check_arity(&self.name, initializer, self.args.len())
            }
            StepKind::Invoke { function, .. } => {
                parse_function(&self.name, function)?;
                check_arity(&self.name, function, self.args.len())
            }
            StepKind::DeployPlain { .. } => Ok(()),
        }
    }

    /// Turn the step's argument sources into concrete values.
    ///
    /// Every `ref` must already be registered.
    pub fn resolve(&self, ctx: &ArgContext<'_>) -> Result<ResolvedArgs, DeployError> {
        let values = self.resolve_all(&self.args, ctx)?;

        let (constructor, target) = match &self.kind {
            StepKind::DeployProxy {
                constructor_args, ..
            } => (self.resolve_all(constructor_args, ctx)?, None),
            StepKind::Invoke { target, .. } => {
                let address = ctx.registry.get(target).ok_or_else(|| {
                    DeployError::UnresolvedDependency {
                        step: self.name.clone(),
                        name: target.clone(),
                    }
                })?;
                (Vec::new(), Some(address))
            }
            StepKind::DeployPlain { .. } => (Vec::new(), None),
        };

        let implementation = self
            .implementation_name()
            .and_then(|name| ctx.registry.get(&name));

        Ok(ResolvedArgs {
            values,
            constructor,
            target,
            implementation,
        })
    }

    fn resolve_all(&self, args: &[Arg], ctx: &ArgContext<'_>) -> Result<Vec<DynSolValue>, DeployError> {
        args.iter().map(|arg| arg.resolve(&self.name, ctx)).collect()
    }
}

/// Source of one constructor, initializer, or call argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    /// Address of a registered component.
    Ref(String),
    /// Address of the chain's signing account.
    Deployer,
    /// Address of the chain's messaging endpoint.
    MessagingEndpoint,
    /// The zero address.
    Zero,
}

impl Arg {
    pub fn reference(name: impl Into<String>) -> Self {
        Self::Ref(name.into())
    }

    fn resolve(&self, step: &str, ctx: &ArgContext<'_>) -> Result<DynSolValue, DeployError> {
        Ok(match self {
            Self::Address(addr) => DynSolValue::Address(*addr),
            Self::Uint(value) => DynSolValue::Uint(*value, 256),
            Self::Bool(value) => DynSolValue::Bool(*value),
            Self::String(value) => DynSolValue::String(value.clone()),
            Self::Bytes(value) => DynSolValue::Bytes(value.to_vec()),
            Self::Ref(name) => DynSolValue::Address(ctx.registry.get(name).ok_or_else(|| {
                DeployError::UnresolvedDependency {
                    step: step.to_string(),
                    name: name.clone(),
                }
            })?),
            Self::Deployer => DynSolValue::Address(ctx.deployer),
            Self::MessagingEndpoint => DynSolValue::Address(ctx.messaging_endpoint),
            Self::Zero => DynSolValue::Address(Address::ZERO),
        })
    }
}

/// What argument resolution can see.
#[derive(Debug, Clone, Copy)]
pub struct ArgContext<'a> {
    pub registry: &'a ContractRegistry,
    pub deployer: Address,
    pub messaging_endpoint: Address,
}

/// Concrete arguments for one step execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedArgs {
    /// Constructor, initializer, or call arguments depending on the step kind.
    pub values: Vec<DynSolValue>,
    /// Implementation constructor arguments of a proxy deployment.
    pub constructor: Vec<DynSolValue>,
    /// Call target of an invocation.
    pub target: Option<Address>,
    /// Implementation deployed by an earlier attempt of a proxy step.
    pub implementation: Option<Address>,
}

/// ABI-encode constructor arguments (no selector).
pub fn encode_constructor(values: &[DynSolValue]) -> Bytes {
    if values.is_empty() {
        return Bytes::new();
    }
    DynSolValue::Tuple(values.to_vec()).abi_encode_params().into()
}

/// ABI-encode a call to `signature` (e.g. `initialize(address,bool)`), selector included.
pub fn encode_call(step: &str, signature: &str, values: &[DynSolValue]) -> Result<Bytes, DeployError> {
    let function = parse_function(step, signature)?;
    check_arity(step, signature, values.len())?;

    for (param, value) in function.inputs.iter().zip(values) {
        let ty = param.resolve().map_err(|e| DeployError::InvalidStep {
            step: step.to_string(),
            reason: format!("unsupported parameter type `{}`: {}", param.ty, e),
        })?;
        if !loosely_matches(&ty, value) {
            return Err(DeployError::InvalidStep {
                step: step.to_string(),
                reason: format!("argument {:?} does not fit parameter type `{}`", value, ty),
            });
        }
    }

    let mut calldata = function.selector().to_vec();
    calldata.extend_from_slice(&encode_constructor(values));
    Ok(calldata.into())
}

fn parse_function(step: &str, signature: &str) -> Result<Function, DeployError> {
    Function::parse(signature).map_err(|e| DeployError::InvalidStep {
        step: step.to_string(),
        reason: format!("invalid function signature `{}`: {}", signature, e),
    })
}

fn check_arity(step: &str, signature: &str, given: usize) -> Result<(), DeployError> {
    let function = parse_function(step, signature)?;
    if function.inputs.len() != given {
        return Err(DeployError::InvalidStep {
            step: step.to_string(),
            reason: format!(
                "`{}` takes {} arguments, {} given",
                signature,
                function.inputs.len(),
                given
            ),
        });
    }
    Ok(())
}

// Unsigned values are resolved as uint256; every uintN occupies the same word.
fn loosely_matches(ty: &DynSolType, value: &DynSolValue) -> bool {
    match (ty, value) {
        (DynSolType::Uint(_), DynSolValue::Uint(..)) => true,
        _ => ty.matches(value),
    }
}

use thiserror::Error;

/// Everything that can go wrong between receiving a query and handing
/// back a response. Almost all of these are configuration-time errors;
/// they surface before any component function has run. The one genuinely
/// runtime kind is `Component`, which wraps whatever a component function
/// reported. The runner treats it like a user interrupt : set the
/// shutdown flag, drain the workers that are already in flight, then
/// propagate.
#[derive(Debug, Clone, Error)]
pub enum HubitError {
    #[error("malformed path '{path}' : {reason}")]
    MalformedPath { path : String, reason : String },

    #[error("no input set on the model instance. Set input using the set_input() method")]
    NoInput,

    #[error("no results found on the model instance so cannot reuse results")]
    NoResults,

    #[error("'{path}' on component '{second}' also provided by component '{first}'")]
    Validation { path : String, first : String, second : String },

    #[error("model config error : {0}")]
    Config(String),

    #[error("no provider for query path '{0}'")]
    NoProvider(String),

    #[error("multiple providers for query path '{path}' : {providers:?}. The path might originate from an expansion of the original query")]
    AmbiguousProvider { path : String, providers : Vec<String> },

    #[error("inconsistent providers for query '{path}' : index contexts {contexts:?} differ")]
    InconsistentContext { path : String, contexts : Vec<String> },

    #[error("cannot decompose query '{path}' : {reason}")]
    Decomposition { path : String, reason : String },

    #[error("cannot find index {index} for index identifier '{ident}'")]
    IndexOutOfRange { index : i64, ident : String },

    #[error("cyclic dependency detected while spawning a provider for '{0}'")]
    CycleDetected(String),

    #[error("worker for component '{component}' : {reason}")]
    Worker { component : String, reason : String },

    #[error("component '{component}' raised : {message}")]
    Component { component : String, message : String },

    #[error("results cache : {0}")]
    Cache(String),
}

impl HubitError {
    pub fn malformed(path : impl Into<String>, reason : impl Into<String>) -> Self {
        HubitError::MalformedPath { path : path.into(), reason : reason.into() }
    }

    pub fn worker(component : impl Into<String>, reason : impl Into<String>) -> Self {
        HubitError::Worker { component : component.into(), reason : reason.into() }
    }

    /// Process exit status used by the binary. Stable per kind so scripts
    /// can discriminate between a bad model and a bad query.
    pub fn exit_code(&self) -> i32 {
        match self {
            HubitError::MalformedPath { .. } => 2,
            HubitError::NoInput => 3,
            HubitError::NoResults => 3,
            HubitError::Validation { .. } => 4,
            HubitError::Config(_) => 4,
            HubitError::NoProvider(_) => 5,
            HubitError::AmbiguousProvider { .. } => 5,
            HubitError::InconsistentContext { .. } => 6,
            HubitError::Decomposition { .. } => 6,
            HubitError::IndexOutOfRange { .. } => 7,
            HubitError::CycleDetected(_) => 8,
            HubitError::Worker { .. } => 9,
            HubitError::Component { .. } => 10,
            HubitError::Cache(_) => 11,
        }
    }
}

pub type Result<T> = std::result::Result<T, HubitError>;

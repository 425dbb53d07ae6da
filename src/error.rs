use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum BalancerError {
    NameEmpty,
    AddressEmpty,
    NameExists(String),
    AddressExists(String),
    UnsupportedMethod(String),
    UnsupportedProtocol(String),
    VirtualServerNotFound(String),
    AlreadyEnabled,
    AlreadyDisabled,
    Tls(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::NameEmpty => write!(f, "virtual server name is empty"),
            BalancerError::AddressEmpty => write!(f, "virtual server address is empty"),
            BalancerError::NameExists(name) => {
                write!(f, "virtual server name already exists: {}", name)
            }
            BalancerError::AddressExists(addr) => {
                write!(f, "virtual server address already exists: {}", addr)
            }
            BalancerError::UnsupportedMethod(m) => write!(f, "unsupported lb method: {}", m),
            BalancerError::UnsupportedProtocol(p) => write!(f, "unsupported protocol: {}", p),
            BalancerError::VirtualServerNotFound(name) => {
                write!(f, "virtual server not found: {}", name)
            }
            BalancerError::AlreadyEnabled => write!(f, "virtual server is already enabled"),
            BalancerError::AlreadyDisabled => write!(f, "virtual server is already disabled"),
            BalancerError::Tls(msg) => write!(f, "tls error: {}", msg),
            BalancerError::Config(msg) => write!(f, "config error: {}", msg),
            BalancerError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BalancerError {}

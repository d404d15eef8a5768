// src/core/proxy/status.rs

use std::fmt;

/// The outcome of a cache lookup, reported in the result header and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupStatus {
    Hit,
    PartialHit,
    RangeMiss,
    KeyMiss,
    Purge,
    ProxyOnly,
    ProxyError,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Hit => "hit",
            LookupStatus::PartialHit => "phit",
            LookupStatus::RangeMiss => "rmiss",
            LookupStatus::KeyMiss => "kmiss",
            LookupStatus::Purge => "purge",
            LookupStatus::ProxyOnly => "proxy-only",
            LookupStatus::ProxyError => "proxy-error",
        }
    }
}

impl fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine that produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    DeltaProxyCache,
    ObjectProxyCache,
    HttpProxy,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::DeltaProxyCache => "DeltaProxyCache",
            Engine::ObjectProxyCache => "ObjectProxyCache",
            Engine::HttpProxy => "HTTPProxy",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state of the fast-forward sub-request of a delta cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastForwardStatus {
    Off,
    Hit,
    Miss,
    Err,
}

impl FastForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FastForwardStatus::Off => "off",
            FastForwardStatus::Hit => "hit",
            FastForwardStatus::Miss => "miss",
            FastForwardStatus::Err => "err",
        }
    }
}

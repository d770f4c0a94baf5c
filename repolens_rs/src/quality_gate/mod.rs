//! Quality-gate service: REST client and the bounded status poller.

mod client;
mod poller;

pub use client::{
    GateCondition, GateProbe, GateStatus, Issue, LANGUAGE_METRICS, Measure, QualityGateClient,
    parse_distribution,
};
pub use poller::QualityGatePoller;

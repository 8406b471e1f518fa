//! Endpoint routing: region classification, the endpoint registry, latency
//! probing, and selection of the active endpoint.

pub mod probe;
pub mod region;
pub mod registry;
pub mod selector;

pub use probe::{LatencyProber, ProbeError, ReqwestLatencyProber, probe_url};
pub use region::{GeoLookup, GeoLookupError, IpApiGeoLookup, Region, classify, detect_region};
pub use registry::{Endpoint, EndpointRegistry, RegistryError};
pub use selector::{
    ActiveSelection, EndpointSelector, ProbeOutcome, SelectionError, SelectionReport,
    SelectionState, SelectorConfig,
};

//! End-to-end test utilities for the Hubfly control plane
//!
//! Runs the full control plane against a temporary directory tree with a
//! scripted proxy engine and certificate authority, so no nginx or ACME
//! server is needed.

pub mod certificates;
pub mod harness;
pub mod mock_ca;
pub mod mock_engine;

pub use certificates::TestCertificates;
pub use harness::TestAppliance;
pub use mock_ca::MockCertificateAuthority;
pub use mock_engine::MockEngine;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `#[test]` attribute that routes `tracing` output to the test harness.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Crates whose events are shown at every level by default.
const CRATES: &[&str] = &["hyp_pool", "kvm_iommu", "pinned_pages"];

fn default_targets() -> Targets {
    CRATES
        .iter()
        .fold(Targets::new().with_default(LevelFilter::WARN), |t, c| {
            t.with_target(*c, LevelFilter::TRACE)
        })
}

#[doc(hidden)]
/// Installs the test subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(default_targets);
        // Another subscriber may already be installed by the test binary.
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}

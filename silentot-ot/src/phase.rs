//! Phase identifiers used for [`silentot_net::metrics`].

pub const BASE_OT: &str = "base-ot";
pub const PPRF_EXPANSION: &str = silentot_pprf::COMMUNICATION_PHASE;
pub const GAP_CORRECTION: &str = "gap-correction";
pub const SILENT_CORRELATED_EXTENSION: &str = "silent-correlated-extension";
pub const SILENT_RANDOM_EXTENSION: &str = "silent-random-extension";
pub const CHOSEN_CONVERSION: &str = "chosen-conversion";
pub const NOISY_VOLE: &str = "noisy-vole";
pub const MALICIOUS_CHECK: &str = "malicious-check";

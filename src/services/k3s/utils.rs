//! K3s utility functions

use rand::RngCore;

/// Generate a random hex token (64 characters = 32 bytes)
pub fn generate_cluster_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

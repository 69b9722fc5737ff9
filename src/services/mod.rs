pub mod assets;
pub mod k3s;

pub mod cluster;
pub mod k8s;

pub mod args;
pub mod cluster_controller;
pub mod configmap;
pub mod deployment;
pub mod object;
pub mod pdb;
pub mod rbac;
pub mod service;

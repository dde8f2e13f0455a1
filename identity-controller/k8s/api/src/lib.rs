#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod node;
mod pod;
mod service_account;

pub use self::{
    node::zone,
    pod::{node_name, runs_on_node, service_account},
    service_account::gsa_annotation,
};
pub use k8s_openapi::api::{
    self,
    core::v1::{ConfigMap, Node, Pod, PodSpec, PodStatus, ServiceAccount},
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams, ResourceExt},
    Client, Error, Resource,
};

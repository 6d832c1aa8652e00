use kube::CustomResourceExt as _;
use varnish_cluster::api::v1alpha1::VarnishCluster;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VarnishCluster::crd())?);
    Ok(())
}

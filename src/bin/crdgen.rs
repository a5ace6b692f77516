use elassandra_k8s::crd::{DataCenter, Task};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&DataCenter::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Task::crd())?);
    Ok(())
}

use kube::CustomResourceExt;

use operator::{PostgreSQLDatabase, PostgreSQLHostCredentials, PostgreSQLServiceUser, PostgreSQLUser};

fn main() -> anyhow::Result<()> {
  for crd in [
    PostgreSQLDatabase::crd(),
    PostgreSQLHostCredentials::crd(),
    PostgreSQLUser::crd(),
    PostgreSQLServiceUser::crd(),
  ] {
    print!("---\n{}", serde_yaml::to_string(&crd)?);
  }
  Ok(())
}

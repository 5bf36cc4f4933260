pub mod application_e2e;
pub mod common;

use application_e2e::{application_config_e2e_test, application_e2e_test};
use common::Error;
use std::env;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cmd = env::args().nth(1).unwrap_or_default();
    match cmd.as_str() {
        "application" => {
            println!("Running application end-to-end test");
            application_e2e_test().await
        }
        "application-config" => {
            println!("Running application config end-to-end test");
            application_config_e2e_test().await
        }
        _ => {
            println!("Please specify one test: application or application-config");
            Ok(())
        }
    }
}

//! Two in-process nodes: one serves a greeting function, the other
//! calls it through a remote interface.
//!
//! ```sh
//! cargo run -p asterisque --example echo
//! ```

use asterisque::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Node::new("server");
    server.serve(
        Service::new("greeter").func(10, "greet", |_pipe, params| async move {
            let name: String = params.get(0)?;
            Ok(Value::String(format!("hello, {}", name)))
        }),
    )?;
    let client = Node::new("client");

    // A real deployment gets its wires from a transport bridge; in one
    // process a cross-connected pair does the same job.
    let (primary, secondary) = Wire::pair();
    server.bind(primary)?;
    let session = client.bind(secondary)?;
    session.wait_active().await?;

    let remote = Remote::new(
        session,
        RemoteInterface::new("greeter").method("greet", 10),
    );
    match remote
        .invoke("greet", vec![Value::String("asterisque".to_string())])
        .await?
    {
        Ok(value) => println!("{}", value),
        Err(abort) => println!("call failed: {}", abort),
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "hg-certgen",
    about = "Generate a development CA plus server and agent certificates for HoneyGrid"
)]
struct Args {
    /// Output directory for the PEM files
    #[arg(long, default_value = "certs")]
    out_dir: PathBuf,

    /// CommonName of the server certificate
    #[arg(long, default_value = "honeygrid-collector")]
    server_name: String,

    /// Subject alternative names for the server certificate
    #[arg(long = "san", default_values_t = vec!["localhost".to_string(), "127.0.0.1".to_string()])]
    sans: Vec<String>,

    /// Agent id to issue a client certificate for (repeatable)
    #[arg(long = "agent", default_values_t = vec!["agent-001".to_string()])]
    agents: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bundle = hg_certgen::generate(&args.server_name, &args.sans, &args.agents)?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create {}", args.out_dir.display()))?;
    let write = |name: &str, contents: &str| -> Result<()> {
        let path = args.out_dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        println!("wrote {}", path.display());
        Ok(())
    };

    write("ca.crt", &bundle.ca.cert)?;
    write("ca.key", &bundle.ca.key)?;
    write("server.crt", &bundle.server.cert)?;
    write("server.key", &bundle.server.key)?;
    for (agent_id, pem) in &bundle.clients {
        write(&format!("client_{agent_id}.crt"), &pem.cert)?;
        write(&format!("client_{agent_id}.key"), &pem.key)?;
    }

    println!(
        "generated CA + server + {} client certificate(s) in {}",
        bundle.clients.len(),
        args.out_dir.display()
    );
    Ok(())
}

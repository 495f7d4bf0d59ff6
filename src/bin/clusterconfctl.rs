// src/bin/clusterconfctl.rs

//! A thin CLI control client: connects to a running `clusterconfd` instance
//! and submits a clusterwide patch. Spec §1 excludes the HTTP/GraphQL admin
//! surface, not an entrypoint altogether; this is the plain TCP equivalent
//! needed to exercise `patch_clusterwide` without embedding the crate.

use anyhow::{Context, Result, bail};
use clusterconf::core::rpc::{Request, Response, RpcConn};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().compact().with_ansi(true).init();

    let args: Vec<String> = env::args().collect();
    let usage = "usage: clusterconfctl <addr> <patch|validate|load> [patch.yml]";

    if args.len() < 3 {
        bail!("{usage}");
    }
    let addr = &args[1];
    let cmd = args[2].as_str();

    let mut conn = RpcConn::connect(addr)
        .await
        .with_context(|| format!("connecting to '{addr}'"))?;

    match cmd {
        "load" => {
            let resp = conn.call(Request::LoadFromFile, None).await?;
            print_doc_response(resp);
        }
        "validate" | "patch" => {
            let Some(path) = args.get(3) else {
                bail!("{usage}");
            };
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading patch file '{path}'"))?;
            let req = if cmd == "validate" {
                Request::ValidateConfig { yaml }
            } else {
                Request::PatchClusterwide { yaml }
            };
            let resp = conn.call(req, None).await?;
            print_unit_response(resp);
        }
        other => bail!("unknown command '{other}'; {usage}"),
    }

    Ok(())
}

fn print_doc_response(resp: Response) {
    match resp {
        Response::OkDoc { yaml } => println!("{yaml}"),
        Response::Ok => println!("ok"),
        Response::Err { message } => eprintln!("error: {message}"),
    }
}

fn print_unit_response(resp: Response) {
    match resp {
        Response::Ok | Response::OkDoc { .. } => println!("ok"),
        Response::Err { message } => eprintln!("error: {message}"),
    }
}

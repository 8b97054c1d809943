//! `verdict submit` command: run one check in this process and follow it.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use verdict_core::event::Cursor;
use verdict_core::service::{CheckService, SubmitRequest};

use crate::tail_cmd;

/// Where the text to verify comes from.
#[derive(Debug)]
pub enum Input<'a> {
    Text(&'a str),
    File(&'a Path),
    Stdin,
}

impl Input<'_> {
    fn read(&self) -> Result<String> {
        match self {
            Self::Text(text) => Ok((*text).to_owned()),
            Self::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display())),
            Self::Stdin => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("failed to read text from stdin")?;
                Ok(text)
            }
        }
    }
}

/// Run the submit command.
pub async fn run_submit(
    service: &CheckService,
    input: Input<'_>,
    check_id: Option<String>,
    owner_id: Option<String>,
) -> Result<()> {
    let content = input.read()?;
    let check_id = check_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let submitted = service
        .submit(SubmitRequest {
            check_id,
            content,
            owner_id,
        })
        .await?;
    println!("Check {} submitted.", submitted.check_id);

    let stream = service
        .open_stream(&submitted.check_id, Cursor::Start, CancellationToken::new())
        .await?
        .with_context(|| format!("check {} has no stream", submitted.check_id))?;
    let printed = tail_cmd::print_stream(stream).await;

    let outcome = submitted
        .relay
        .await
        .context("relay task panicked")?;
    match outcome {
        Some(outcome) => println!(
            "Check {} finished: {} ({} events)",
            submitted.check_id, outcome.status, outcome.events_appended
        ),
        None => bail!("relay for check {} failed", submitted.check_id),
    }
    printed
}

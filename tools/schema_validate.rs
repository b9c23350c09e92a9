use std::{
    env, fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use tsm_dispatcher::codec::{decode, DynSchemaValidator};

fn validate_file(validator: &DynSchemaValidator, payload_path: &Path) -> Result<()> {
    let raw = fs::read(payload_path)
        .with_context(|| format!("failed to read payload {}", payload_path.display()))?;
    let content = decode(&raw)
        .with_context(|| format!("{} could not be decoded", payload_path.display()))?;
    if let Err(violation) = validator.validate(content.as_value()) {
        bail!(
            "schema validation failed:\n- {}: {}",
            payload_path.display(),
            violation
        );
    }
    Ok(())
}

fn parse_args() -> Result<(PathBuf, Vec<PathBuf>)> {
    let mut args = env::args().skip(1);
    let mut schema_path = None;
    let mut payloads = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--schema" {
            let path = args.next().context("expected a path after --schema")?;
            schema_path = Some(PathBuf::from(path));
        } else {
            payloads.push(PathBuf::from(arg));
        }
    }

    let Some(schema_path) = schema_path.filter(|_| !payloads.is_empty()) else {
        bail!("Usage: schema-validate --schema <schema.avsc|schema.json> <payload> [more payloads...]");
    };

    Ok((schema_path, payloads))
}

fn run() -> Result<()> {
    let (schema_path, payloads) = parse_args()?;
    let validator = tsm_dispatcher::codec::load_schema(&schema_path)
        .with_context(|| format!("failed to load schema {}", schema_path.display()))?;

    let mut failed = 0usize;
    for payload in &payloads {
        match validate_file(&validator, payload) {
            Ok(()) => eprintln!("validated {}", payload.display()),
            Err(err) => {
                eprintln!("{err:#}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} payloads failed validation", payloads.len());
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

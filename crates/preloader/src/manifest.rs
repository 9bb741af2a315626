//! Reading request manifests.
//!
//! A manifest lists the resources to preload, as a markup scanner would declare them. It is
//! either a plain list of requests or a document with a `resources` list. JSON manifests are
//! accepted as well, since every JSON document is also valid YAML.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use preloader_service::types::PreloadRequest;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<PreloadRequest>),
    Document { resources: Vec<PreloadRequest> },
}

/// Reads the requests from the manifest at `path`.
pub fn read(path: &Path) -> Result<Vec<PreloadRequest>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse(&contents).with_context(|| format!("invalid manifest {}", path.display()))
}

pub fn parse(contents: &str) -> Result<Vec<PreloadRequest>> {
    if contents.trim().is_empty() {
        bail!("manifest is empty");
    }

    let requests = match serde_yaml::from_str(contents)? {
        Manifest::List(requests) => requests,
        Manifest::Document { resources } => resources,
    };
    tracing::debug!(count = requests.len(), "Read request manifest");

    Ok(requests)
}

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use super::backends::Backend;
use crate::util::errors::StdError;

pub const TEMPLATE_SUFFIX: &str = ".tmpl";
pub const VCL_SUFFIX: &str = ".vcl";

pub type FileSet = BTreeMap<String, String>;

/// Static VCL files and templates of a ConfigMap, templates keyed by their output name.
///
/// Entries that would not produce a `.vcl` file are skipped: only those are ever
/// synced into the VCL directory.
pub fn split_files_and_templates(data: &BTreeMap<String, String>) -> (FileSet, FileSet) {
    let mut files = FileSet::new();
    let mut templates = FileSet::new();
    for (name, contents) in data {
        let (target, output) = match name.strip_suffix(TEMPLATE_SUFFIX) {
            Some(rendered) => (&mut templates, rendered),
            None => (&mut files, name.as_str()),
        };
        if output.ends_with(VCL_SUFFIX) {
            target.insert(output.to_string(), contents.clone());
        } else {
            warn!(entry = %name, "Skipping ConfigMap entry that is not a VCL file");
        }
    }
    (files, templates)
}

pub fn verify_entrypoint(files: &FileSet, templates: &FileSet, entrypoint: &str) -> Result<(), StdError> {
    if files.contains_key(entrypoint) || templates.contains_key(entrypoint) {
        Ok(())
    } else {
        Err(StdError::InvalidArgument(format!(
            "{entrypoint} must exist in configmap, but not found"
        )))
    }
}

/// Values a VCL template can refer to
#[derive(Clone, Debug, Serialize)]
pub struct TemplateContext {
    pub backends: Vec<Backend>,
    pub target_port: i32,
    pub varnish_nodes: Vec<Backend>,
    pub varnish_port: i32,
}

/// Renders every template. A variable missing from the context is an error.
pub fn render_templates(templates: &FileSet, context: &TemplateContext) -> Result<FileSet, StdError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);

    templates
        .iter()
        .map(|(name, source)| -> Result<(String, String), StdError> {
            let rendered = env
                .template_from_named_str(name.as_str(), source.as_str())
                .and_then(|template| template.render(context))
                .map_err(StdError::TemplateError)?;
            Ok((name.clone(), rendered))
        })
        .collect()
}

/// Static files plus rendered templates. A name present in both is a configuration error.
pub fn merge_rendered(mut files: FileSet, rendered: FileSet) -> Result<FileSet, StdError> {
    for (name, contents) in rendered {
        if files.contains_key(&name) {
            return Err(StdError::InvalidArgument(format!(
                "ConfigMap has {name} and {name}{TEMPLATE_SUFFIX} entries. Cannot include file and template with same name"
            )));
        }
        files.insert(name, contents);
    }
    Ok(files)
}

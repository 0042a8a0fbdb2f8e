//! Reading model definitions from JSON exchange files

use std::path::Path;

use super::types::ModelDefinition;
use super::validation::Validator;
use super::CompartmentalModel;
use crate::error::PbpkError;

/// Parse a model definition from JSON text
///
/// Only well-formedness is checked here; see [`Validator`] for the semantic checks.
pub fn parse_model(text: &str, source_name: &str) -> Result<ModelDefinition, PbpkError> {
    serde_json::from_str(text).map_err(|e| PbpkError::parse(source_name, e.to_string()))
}

fn read(path: &Path) -> Result<String, PbpkError> {
    std::fs::read_to_string(path).map_err(|e| PbpkError::io(path, e))
}

/// Read and validate a model definition that may still be composed with
/// other submodels
pub fn load_definition(path: impl AsRef<Path>) -> Result<ModelDefinition, PbpkError> {
    let path = path.as_ref();
    let definition = parse_model(&read(path)?, &path.display().to_string())?;
    Validator::submodel().validate(&definition)?;
    tracing::info!(
        model = %definition.id,
        path = %path.display(),
        species = definition.species.len(),
        reactions = definition.reactions.len(),
        "loaded model definition"
    );
    Ok(definition)
}

/// Read, validate and compile a complete model
pub fn load_model(path: impl AsRef<Path>) -> Result<CompartmentalModel, PbpkError> {
    let path = path.as_ref();
    let definition = parse_model(&read(path)?, &path.display().to_string())?;
    let model = CompartmentalModel::new(definition)?;
    tracing::info!(model = %model.id(), states = model.nstates(), "loaded model");
    Ok(model)
}

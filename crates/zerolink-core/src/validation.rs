//! Argument checks run before a method is invoked.

use crate::marshal::{Fault, ServiceError};
use crate::registry::{CallArgs, ParamSpec};
use std::collections::HashSet;

/// Pre-dispatch hook: `Err` is sent back to the caller instead of invoking.
pub type ValidationHook = fn(Option<&[ParamSpec]>, &CallArgs) -> Result<(), Fault>;

/// Check `call` against declared parameters; undeclared methods pass.
///
/// Arity problems are `TypeError`s, a value of the wrong kind is a `ValueError`.
pub fn validate_or_ignore(params: Option<&[ParamSpec]>, call: &CallArgs) -> Result<(), Fault> {
    let Some(params) = params else {
        return Ok(());
    };

    if call.args.len() > params.len() {
        return Err(ServiceError::type_error(format!(
            "takes {} positional arguments but {} were given",
            params.len(),
            call.args.len()
        ))
        .into());
    }

    let mut seen = HashSet::new();

    for (expected, value) in params.iter().zip(&call.args) {
        seen.insert(expected.name.as_str());
        if call.kwargs.contains_key(&expected.name) {
            return Err(ServiceError::type_error(format!(
                "got multiple values for argument '{}'",
                expected.name
            ))
            .into());
        }
        check_kind(expected, value)?;
    }

    for (name, value) in &call.kwargs {
        let expected = params.iter().find(|expected| &expected.name == name).ok_or_else(|| {
            ServiceError::type_error(format!("got an unexpected keyword argument '{}'", name))
        })?;
        seen.insert(expected.name.as_str());
        check_kind(expected, value)?;
    }

    if let Some(missing) = params
        .iter()
        .find(|expected| expected.required && !seen.contains(expected.name.as_str()))
    {
        return Err(ServiceError::type_error(format!(
            "missing required argument '{}'",
            missing.name
        ))
        .into());
    }

    Ok(())
}

fn check_kind(expected: &ParamSpec, value: &serde_json::Value) -> Result<(), Fault> {
    if value.is_null() && !expected.required {
        return Ok(());
    }
    if !expected.kind.matches(value) {
        return Err(ServiceError::value(format!(
            "Argument {} should be of type {}",
            expected.name,
            expected.kind.name()
        ))
        .into());
    }
    Ok(())
}

use crate::utils::error::{Result, RfError};
use std::fmt::Display;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field: &str, value: impl Display, reason: impl Into<String>) -> RfError {
    RfError::InvalidConfigValueError {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Output locations: non-empty and free of NUL bytes.
pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    match path {
        "" => Err(invalid(field_name, path, "Path cannot be empty")),
        p if p.contains('\0') => Err(invalid(field_name, path.escape_debug(), "Path contains null bytes")),
        _ => Ok(()),
    }
}

/// Counts such as iteration budgets, sample points and parallelism.
pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(invalid(field_name, value, format!("Value must be at least {}", min_value)));
    }
    Ok(())
}

/// Physical quantities: finite and strictly greater than zero.
pub fn validate_positive_real(field_name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field_name, value, "Value must be a finite number greater than zero"))
    }
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| RfError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field_name, value, "Value cannot be empty or whitespace-only"));
    }
    Ok(())
}

/// Inclusive bounds. NaN never passes.
pub fn validate_range<T: PartialOrd + Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(invalid(field_name, value, format!("Value must be between {} and {}", min, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive_real() {
        assert!(validate_positive_real("target.frequency_hz", 2.4e9).is_ok());
        assert!(validate_positive_real("target.frequency_hz", 0.0).is_err());
        assert!(validate_positive_real("target.frequency_hz", -1.0).is_err());
        assert!(validate_positive_real("target.frequency_hz", f64::NAN).is_err());
        assert!(validate_positive_real("target.frequency_hz", f64::INFINITY).is_err());
    }

    #[test]
    fn test_validate_range_rejects_nan() {
        assert!(validate_range("mesh.max_cell_fraction", 0.05, 0.0, 1.0).is_ok());
        assert!(validate_range("mesh.max_cell_fraction", 1.0, 0.0, 1.0).is_ok());
        assert!(validate_range("mesh.max_cell_fraction", 1.5, 0.0, 1.0).is_err());
        assert!(validate_range("mesh.max_cell_fraction", f64::NAN, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("sweep.max_parallel", 4, 1).is_ok());
        let err = validate_positive_number("sweep.max_parallel", 0, 1).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_validate_path_and_strings() {
        assert!(validate_path("output.path", "./output").is_ok());
        assert!(validate_path("output.path", "").is_err());
        assert!(validate_path("output.path", "out\0put").is_err());
        assert!(validate_non_empty_string("design.name", "   ").is_err());
        let missing: Option<u32> = None;
        assert!(matches!(
            validate_required_field("solver.command", &missing),
            Err(RfError::MissingConfigError { .. })
        ));
    }
}

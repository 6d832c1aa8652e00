use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity};

use crate::util::errors::StdError;

const BINARY_SUFFIXES: [(&str, u32); 6] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];
const DECIMAL_SUFFIXES: [(&str, i32); 7] = [("m", -1), ("k", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5), ("E", 6)];

/// Value of a quantity in base units (bytes, cores)
fn quantity_value(quantity: &Quantity) -> Result<f64, StdError> {
    let raw = quantity.0.trim();
    let invalid = || StdError::InvalidArgument(format!("'{raw}' is not a valid quantity"));

    let (number, multiplier) = if let Some((num, power)) = BINARY_SUFFIXES
        .iter()
        .find_map(|(suffix, power)| raw.strip_suffix(suffix).map(|n| (n, *power)))
    {
        (num, 1024f64.powi(power as i32))
    } else if let Some((num, power)) = DECIMAL_SUFFIXES
        .iter()
        .find_map(|(suffix, power)| raw.strip_suffix(suffix).map(|n| (n, *power)))
    {
        (num, 10f64.powi(power * 3))
    } else if let Some((num, exp)) = raw.split_once(['e', 'E']) {
        let exp: i32 = exp.parse().map_err(|_| invalid())?;
        (num, 10f64.powi(exp))
    } else {
        (raw, 1f64)
    };

    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(value * multiplier)
}

/// Converts a memory quantity (`2Gi`, `512M`, `1e9`, `1073741824`) to bytes, rounding down.
pub fn quantity_to_bytes(quantity: &Quantity) -> Result<i64, StdError> {
    #[allow(clippy::cast_possible_truncation)]
    Ok(quantity_value(quantity)?.floor() as i64)
}

/// Converts a quantity to thousandths of its unit, so `0.5`, `500m` and `5e-1` agree.
pub fn quantity_to_millis(quantity: &Quantity) -> Result<i64, StdError> {
    #[allow(clippy::cast_possible_truncation)]
    Ok((quantity_value(quantity)? * 1000.0).round() as i64)
}

/// The same amount written as `<n>m`, or the input when it does not parse.
pub fn normalize_quantity(quantity: &Quantity) -> Quantity {
    match quantity_to_millis(quantity) {
        Ok(millis) => Quantity(format!("{millis}m")),
        Err(_) => quantity.clone(),
    }
}

/// Rewrites limits and requests in one notation. The API server may store a quantity
/// in another form than it was written in.
pub fn normalize_resources(resources: &mut ResourceRequirements) {
    for quantities in [resources.limits.as_mut(), resources.requests.as_mut()].into_iter().flatten() {
        for quantity in quantities.values_mut() {
            *quantity = normalize_quantity(quantity);
        }
    }
}

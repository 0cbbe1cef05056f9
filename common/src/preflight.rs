//! Chequeos que invalidan la corrida entera; se hacen una vez, antes de tocar
//! cualquier unidad.

use tracing::info;

use crate::{
    config::{ApplyConfig, Encodings},
    error::PreflightError,
};

/// Las clases de arrecife tienen que tener los códigos más altos: la máscara
/// se calcula como `A >= min(reef_top, not_reef_top)`.
pub fn check_encodings(encodings: &Encodings) -> Result<(), PreflightError> {
    let max_other = encodings.max_other();
    if encodings.reef_top > max_other && encodings.not_reef_top > max_other {
        return Ok(());
    }
    Err(PreflightError::EncodingOrder {
        reef_top: encodings.reef_top,
        not_reef_top: encodings.not_reef_top,
        max_other,
    })
}

pub fn preflight(config: &ApplyConfig) -> Result<(), PreflightError> {
    config.validate()?;
    check_encodings(&config.encodings)?;
    info!(
        "pre-flight ok: {} (umbral de arrecife {})",
        config.config_name,
        config.encodings.min_reef()
    );
    Ok(())
}

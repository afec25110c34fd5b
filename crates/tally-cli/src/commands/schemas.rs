//! Schemas command for listing registered schemas.

use std::io::Write;

use anyhow::Result;

use tally_core::ModelRegistry;

pub fn run<W: Write>(writer: &mut W, registry: &ModelRegistry) -> Result<()> {
    let schemas = registry.schemas();
    if schemas.is_empty() {
        writeln!(writer, "No schemas registered.")?;
        return Ok(());
    }

    for (name, definition) in schemas {
        match &definition.description {
            Some(description) => writeln!(writer, "{name}: {description}")?,
            None => writeln!(writer, "{name}")?,
        }
        for field in &definition.fields {
            match field.data_type {
                Some(data_type) => writeln!(writer, "  - {} ({data_type})", field.name)?,
                None => writeln!(writer, "  - {}", field.name)?,
            }
        }
    }
    Ok(())
}

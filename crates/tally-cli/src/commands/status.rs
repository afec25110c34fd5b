//! Status command for showing stored collections.

use std::io::Write;
use std::path::Path;

use anyhow::Result;

use tally_db::Database;

pub fn run<W: Write>(writer: &mut W, db: &Database, database_path: &Path) -> Result<()> {
    let collections = db.list_collections()?;

    writeln!(writer, "Tally status")?;
    writeln!(writer, "Database: {}", database_path.display())?;

    if collections.is_empty() {
        writeln!(writer, "No collections.")?;
        return Ok(());
    }

    writeln!(writer, "Collections:")?;
    for collection in collections {
        writeln!(
            writer,
            "- {} ({} / {}): {} records",
            collection.name, collection.tenant, collection.schema, collection.records
        )?;
    }

    Ok(())
}

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

use refugio_registry::{
    count_ingresos, count_personas, get_refugio_stats, insert_refugio, open_database,
    IngestionPipeline, UploadError, MAX_UPLOAD_BYTES,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&args[2..]),
        Some("add-refugio") => run_add_refugio(&args[2..]),
        Some("stats") => run_stats(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Refugio Registry - importación masiva de personas");
    println!();
    println!("Usage:");
    println!("  refugio-registry import <archivo.csv> <refugio_id> [usuario_id]");
    println!("  refugio-registry add-refugio <nombre> <capacidad>");
    println!("  refugio-registry stats");
    println!();
    println!("Database path comes from REFUGIO_DB (default: refugios.db)");
}

fn db_path() -> PathBuf {
    env::var("REFUGIO_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("refugios.db"))
}

fn run_import(args: &[String]) -> Result<()> {
    let [archivo, refugio_id, rest @ ..] = args else {
        bail!("Usage: refugio-registry import <archivo.csv> <refugio_id> [usuario_id]");
    };

    let refugio_id: i64 = refugio_id
        .parse()
        .context("refugio_id must be a number")?;
    let usuario_id: i64 = match rest.first() {
        Some(value) => value.parse().context("usuario_id must be a number")?,
        None => 1,
    };

    println!("📂 Importando {archivo} → refugio {refugio_id}");

    // Scoped read: the file handle is closed before any row work starts
    let data = std::fs::read(archivo)
        .with_context(|| format!("Failed to read file: {archivo}"))?;

    if data.len() > MAX_UPLOAD_BYTES {
        bail!("El archivo es demasiado grande (máximo 5MB)");
    }

    let mut conn = open_database(&db_path())?;
    println!("✓ Database ready: {}", db_path().display());

    let nombre_original = std::path::Path::new(archivo)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.csv");

    let pipeline = IngestionPipeline::sqlite();
    match pipeline.run(&mut conn, &data, nombre_original, refugio_id, usuario_id) {
        Ok(report) => {
            println!("✓ Upload {} completado", report.upload_id);
            println!("  Procesadas: {}", report.stats.processed);
            println!("  Exitosas:   {}", report.stats.successful);
            println!("  Con error:  {}", report.stats.errors);
            for detail in &report.stats.error_details {
                println!("    - {detail}");
            }

            println!();
            println!(
                "✓ Registro actual: {} personas, {} ingresos",
                count_personas(&conn)?,
                count_ingresos(&conn)?
            );
            Ok(())
        }
        Err(UploadError::Structure(err)) => {
            bail!("Archivo rechazado: {err}");
        }
        Err(UploadError::Infrastructure(err)) => Err(err.context("Import failed")),
    }
}

fn run_add_refugio(args: &[String]) -> Result<()> {
    let [nombre, capacidad] = args else {
        bail!("Usage: refugio-registry add-refugio <nombre> <capacidad>");
    };

    let capacidad: i64 = capacidad.parse().context("capacidad must be a number")?;

    let conn = open_database(&db_path())?;
    let id = insert_refugio(&conn, nombre, capacidad)?;

    println!("✓ Refugio {id}: {nombre} (capacidad {capacidad})");
    Ok(())
}

fn run_stats() -> Result<()> {
    let conn = open_database(&db_path())?;

    let stats = get_refugio_stats(&conn)?;
    if stats.is_empty() {
        println!("Sin refugios registrados");
        return Ok(());
    }

    println!("Ocupación por refugio:");
    for stat in stats {
        println!(
            "  {} — {}/{} alojados",
            stat.nombre, stat.alojados, stat.capacidad_maxima
        );
    }

    Ok(())
}

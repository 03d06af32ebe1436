// 🔍 Identity Resolution - find-or-create personas across uploads
//
// The shelter domain has no national-ID column, so re-uploads are matched by
// an identity fingerprint over the fields that define a persona: preferred
// name (normalized), age range and gender. Same fingerprint = same persona,
// update path; unknown fingerprint = new persona.

use chrono::Local;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::validator::{EntryFields, EntryStatus, IdentityFields, ValidatedPersonRecord};

// ============================================================================
// REGISTRY ERRORS
// ============================================================================

/// Database failure raised by the registry, split by blast radius.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Constraint violation: the current row fails, the batch continues.
    #[error("Registro rechazado: {0}")]
    Constraint(String),

    /// Anything else is infrastructure; the whole batch rolls back.
    #[error("Error de base de datos: {0}")]
    Fatal(String),
}

impl RegistryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::Fatal(_))
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                RegistryError::Constraint(err.to_string())
            }
            _ => RegistryError::Fatal(err.to_string()),
        }
    }
}

// ============================================================================
// IDENTITY FINGERPRINT
// ============================================================================

/// Compute the identity fingerprint for dedup across uploads.
/// Preferred name is normalized (trimmed, lowercased); age range and gender
/// enter with their stored values.
pub fn identity_fingerprint(identity: &IdentityFields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}",
        identity.nombre_preferido.trim().to_lowercase(),
        identity.edad_rango.as_str(),
        identity.genero.as_str()
    ));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// PERSON REGISTRY
// ============================================================================

/// Persistence seam for personas and shelter entries.
///
/// Every method runs against the caller's connection so that, inside a batch,
/// all writes share the batch transaction and roll back together.
pub trait PersonRegistry {
    fn find_by_fingerprint(
        &self,
        conn: &Connection,
        fingerprint: &str,
    ) -> Result<Option<i64>, RegistryError>;

    fn create_person(
        &self,
        conn: &Connection,
        record: &ValidatedPersonRecord,
        fingerprint: &str,
    ) -> Result<i64, RegistryError>;

    /// Last-write-wins update of an existing persona with the new record's
    /// fields; no field-level merge.
    fn update_person(
        &self,
        conn: &Connection,
        persona_id: i64,
        record: &ValidatedPersonRecord,
    ) -> Result<(), RegistryError>;

    /// Register a stay at a refugio. At most one open entry (no fecha_salida)
    /// per persona per refugio: an existing open entry is returned as-is.
    fn register_entry(
        &self,
        conn: &Connection,
        persona_id: i64,
        refugio_id: i64,
        entry: &EntryFields,
        usuario_id: i64,
    ) -> Result<i64, RegistryError>;
}

pub struct SqlitePersonRegistry;

impl SqlitePersonRegistry {
    pub fn new() -> Self {
        SqlitePersonRegistry
    }
}

impl Default for SqlitePersonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PersonRegistry for SqlitePersonRegistry {
    fn find_by_fingerprint(
        &self,
        conn: &Connection,
        fingerprint: &str,
    ) -> Result<Option<i64>, RegistryError> {
        let mut stmt = conn.prepare("SELECT id FROM Personas WHERE huella_identidad = ?1")?;
        let mut rows = stmt.query_map(params![fingerprint], |row| row.get::<_, i64>(0))?;

        match rows.next() {
            Some(id) => Ok(Some(id?)),
            None => Ok(None),
        }
    }

    fn create_person(
        &self,
        conn: &Connection,
        record: &ValidatedPersonRecord,
        fingerprint: &str,
    ) -> Result<i64, RegistryError> {
        conn.execute(
            "INSERT INTO Personas (
                huella_identidad, nombre_preferido, edad_rango, genero,
                idioma_principal, grupo_jefe, grupo_id_externo, relacion_con_jefe
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fingerprint,
                record.identity.nombre_preferido,
                record.identity.edad_rango.as_str(),
                record.identity.genero.as_str(),
                record.identity.idioma_principal,
                record.group.grupo_jefe,
                record.group.grupo_id_externo,
                record.group.relacion_con_jefe,
            ],
        )?;

        let persona_id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO Salud (
                persona_id, condicion_medica, medicamentos, alergias, asistencia_especial
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                persona_id,
                record.health.condicion_medica,
                record.health.medicamentos,
                record.health.alergias,
                record.health.asistencia_especial,
            ],
        )?;

        conn.execute(
            "INSERT INTO Procedencia (
                persona_id, localidad, situacion, tiene_mascotas, mascotas_detalle
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                persona_id,
                record.origin.localidad,
                record.origin.situacion.as_str(),
                record.origin.tiene_mascotas,
                record.origin.mascotas_detalle,
            ],
        )?;

        Ok(persona_id)
    }

    fn update_person(
        &self,
        conn: &Connection,
        persona_id: i64,
        record: &ValidatedPersonRecord,
    ) -> Result<(), RegistryError> {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        conn.execute(
            "UPDATE Personas
             SET nombre_preferido = ?1, edad_rango = ?2, genero = ?3,
                 idioma_principal = ?4, grupo_jefe = ?5, grupo_id_externo = ?6,
                 relacion_con_jefe = ?7, actualizado_en = ?8
             WHERE id = ?9",
            params![
                record.identity.nombre_preferido,
                record.identity.edad_rango.as_str(),
                record.identity.genero.as_str(),
                record.identity.idioma_principal,
                record.group.grupo_jefe,
                record.group.grupo_id_externo,
                record.group.relacion_con_jefe,
                now,
                persona_id,
            ],
        )?;

        let updated = conn.execute(
            "UPDATE Salud
             SET condicion_medica = ?1, medicamentos = ?2, alergias = ?3,
                 asistencia_especial = ?4
             WHERE persona_id = ?5",
            params![
                record.health.condicion_medica,
                record.health.medicamentos,
                record.health.alergias,
                record.health.asistencia_especial,
                persona_id,
            ],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO Salud (
                    persona_id, condicion_medica, medicamentos, alergias, asistencia_especial
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    persona_id,
                    record.health.condicion_medica,
                    record.health.medicamentos,
                    record.health.alergias,
                    record.health.asistencia_especial,
                ],
            )?;
        }

        let updated = conn.execute(
            "UPDATE Procedencia
             SET localidad = ?1, situacion = ?2, tiene_mascotas = ?3, mascotas_detalle = ?4
             WHERE persona_id = ?5",
            params![
                record.origin.localidad,
                record.origin.situacion.as_str(),
                record.origin.tiene_mascotas,
                record.origin.mascotas_detalle,
                persona_id,
            ],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO Procedencia (
                    persona_id, localidad, situacion, tiene_mascotas, mascotas_detalle
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    persona_id,
                    record.origin.localidad,
                    record.origin.situacion.as_str(),
                    record.origin.tiene_mascotas,
                    record.origin.mascotas_detalle,
                ],
            )?;
        }

        Ok(())
    }

    fn register_entry(
        &self,
        conn: &Connection,
        persona_id: i64,
        refugio_id: i64,
        entry: &EntryFields,
        usuario_id: i64,
    ) -> Result<i64, RegistryError> {
        // One open entry per persona per refugio
        let mut stmt = conn.prepare(
            "SELECT id FROM Ingresos
             WHERE persona_id = ?1 AND refugio_id = ?2 AND fecha_salida IS NULL",
        )?;
        let mut open = stmt.query_map(params![persona_id, refugio_id], |row| {
            row.get::<_, i64>(0)
        })?;

        if let Some(existing) = open.next() {
            return Ok(existing?);
        }

        let now = Local::now();
        let fecha = entry
            .fecha_ingreso
            .unwrap_or_else(|| now.date_naive())
            .format("%Y-%m-%d")
            .to_string();
        let hora = entry
            .hora_ingreso
            .unwrap_or_else(|| now.time())
            .format("%H:%M:%S")
            .to_string();
        let estatus = entry.estatus.unwrap_or(EntryStatus::Housed);

        conn.execute(
            "INSERT INTO Ingresos (
                persona_id, refugio_id, fecha_ingreso, hora_ingreso,
                area_asignada, estatus, observaciones, registrado_por
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                persona_id,
                refugio_id,
                fecha,
                hora,
                entry.area_asignada,
                estatus.as_str(),
                entry.observaciones,
                usuario_id,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }
}

// ============================================================================
// PERSON RESOLVER
// ============================================================================

/// Outcome of resolving one record's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub persona_id: i64,
    pub created: bool,
}

pub struct PersonResolver;

impl PersonResolver {
    pub fn new() -> Self {
        PersonResolver
    }

    /// Find-or-create: an existing persona gets a last-write-wins update, an
    /// unknown one is created. Runs inside the caller's transaction.
    pub fn resolve(
        &self,
        conn: &Connection,
        registry: &dyn PersonRegistry,
        record: &ValidatedPersonRecord,
    ) -> Result<Resolution, RegistryError> {
        let fingerprint = identity_fingerprint(&record.identity);

        match registry.find_by_fingerprint(conn, &fingerprint)? {
            Some(persona_id) => {
                debug!(persona_id, "persona exists, updating");
                registry.update_person(conn, persona_id, record)?;
                Ok(Resolution {
                    persona_id,
                    created: false,
                })
            }
            None => {
                let persona_id = registry.create_person(conn, record, &fingerprint)?;
                debug!(persona_id, "persona created");
                Ok(Resolution {
                    persona_id,
                    created: true,
                })
            }
        }
    }
}

impl Default for PersonResolver {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

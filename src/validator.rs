// ✅ Row Validation - field presence, enums, date/time formats
// All row errors are data; nothing here panics or aborts the batch

use chrono::{NaiveDate, NaiveTime};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ColumnMap;

// ============================================================================
// DOMAIN ENUMS
// ============================================================================

/// Rango de edad de la persona registrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeRange {
    Child,
    Adolescent,
    Adult,
    Elder,
}

impl AgeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeRange::Child => "Niño/a",
            AgeRange::Adolescent => "Adolescente",
            AgeRange::Adult => "Adulto",
            AgeRange::Elder => "Adulto mayor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Niño/a" => Some(AgeRange::Child),
            "Adolescente" => Some(AgeRange::Adolescent),
            "Adulto" => Some(AgeRange::Adult),
            "Adulto mayor" => Some(AgeRange::Elder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Female,
    Male,
    Other,
    PreferNotToSay,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Female => "F",
            Gender::Male => "M",
            Gender::Other => "Otro",
            Gender::PreferNotToSay => "Prefiere no decir",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "F" => Some(Gender::Female),
            "M" => Some(Gender::Male),
            "Otro" => Some(Gender::Other),
            "Prefiere no decir" => Some(Gender::PreferNotToSay),
            _ => None,
        }
    }
}

/// Situación que llevó a la persona al refugio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Situation {
    HousingLost,
    TemporarilyDisplaced,
    PreventiveEvacuation,
}

impl Situation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Situation::HousingLost => "Vivienda perdida",
            Situation::TemporarilyDisplaced => "Temporalmente desplazado",
            Situation::PreventiveEvacuation => "Evacuación preventiva",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Vivienda perdida" => Some(Situation::HousingLost),
            "Temporalmente desplazado" => Some(Situation::TemporarilyDisplaced),
            "Evacuación preventiva" => Some(Situation::PreventiveEvacuation),
            _ => None,
        }
    }
}

/// Estatus del ingreso dentro del refugio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Housed,
    Discharged,
    Transferred,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Housed => "Alojado",
            EntryStatus::Discharged => "Dado de alta",
            EntryStatus::Transferred => "Trasladado a otro refugio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Alojado" => Some(EntryStatus::Housed),
            "Dado de alta" => Some(EntryStatus::Discharged),
            "Trasladado a otro refugio" => Some(EntryStatus::Transferred),
            _ => None,
        }
    }
}

// ============================================================================
// ROW ERRORS
// ============================================================================

/// Per-row validation failure. One reason per row: validation short-circuits
/// at the first rule that fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("Column count mismatch")]
    ColumnCountMismatch { expected: usize, found: usize },

    #[error("Missing required field: {0}")]
    MissingRequiredField(&'static str),

    #[error("Invalid {field}")]
    InvalidEnumValue { field: &'static str, value: String },

    #[error("Invalid {field} format")]
    InvalidDateFormat { field: &'static str, value: String },

    #[error("Invalid {field} format")]
    InvalidTimeFormat { field: &'static str, value: String },
}

// ============================================================================
// CSV ROW + VALIDATED RECORD
// ============================================================================

/// One raw data row during iteration. Row numbers are 1-based and count the
/// header, so the first data row is row 2.
pub struct CsvRow<'a> {
    pub row_number: usize,
    pub record: &'a StringRecord,
}

/// Fully validated person record, ready for ingestion.
///
/// Identity and entry groups are always populated; group, health and origin
/// details carry whatever the upload provided.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedPersonRecord {
    pub identity: IdentityFields,
    pub group: GroupFields,
    pub health: HealthFields,
    pub origin: OriginFields,
    pub entry: EntryFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityFields {
    pub nombre_preferido: String,
    pub edad_rango: AgeRange,
    pub genero: Gender,
    pub idioma_principal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupFields {
    /// Whether this person is the head of their family group.
    pub grupo_jefe: bool,
    pub grupo_id_externo: Option<String>,
    pub relacion_con_jefe: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthFields {
    pub condicion_medica: Option<String>,
    pub medicamentos: Option<String>,
    pub alergias: Option<String>,
    pub asistencia_especial: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OriginFields {
    pub localidad: String,
    pub situacion: Situation,
    pub tiene_mascotas: bool,
    pub mascotas_detalle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryFields {
    /// Defaults to the registration date when the upload leaves it empty.
    pub fecha_ingreso: Option<NaiveDate>,
    pub hora_ingreso: Option<NaiveTime>,
    pub area_asignada: String,
    pub estatus: Option<EntryStatus>,
    pub observaciones: Option<String>,
}

// ============================================================================
// ROW VALIDATOR
// ============================================================================

pub struct RowValidator;

impl RowValidator {
    pub fn new() -> Self {
        RowValidator
    }

    /// Validate one data row against the validated header.
    ///
    /// Rules run in a fixed order and stop at the first failure, so the
    /// uploader sees exactly one reason per row.
    pub fn validate(
        &self,
        row: &CsvRow<'_>,
        columns: &ColumnMap,
    ) -> Result<ValidatedPersonRecord, RowError> {
        let record = row.record;

        // 1. Column count must match the header
        if record.len() != columns.column_count() {
            return Err(RowError::ColumnCountMismatch {
                expected: columns.column_count(),
                found: record.len(),
            });
        }

        // 2. Required fields non-empty
        for required in [
            "nombre_preferido",
            "edad_rango",
            "genero",
            "localidad",
            "situacion",
            "area_asignada",
        ] {
            if field(record, columns, required).is_empty() {
                return Err(RowError::MissingRequiredField(required));
            }
        }

        // 3. Enum membership
        let edad_rango = parse_enum(record, columns, "edad_rango", AgeRange::parse)?;
        let genero = parse_enum(record, columns, "genero", Gender::parse)?;
        let situacion = parse_enum(record, columns, "situacion", Situation::parse)?;

        let estatus = match field(record, columns, "estatus") {
            "" => None,
            value => Some(EntryStatus::parse(value).ok_or_else(|| {
                RowError::InvalidEnumValue {
                    field: "estatus",
                    value: value.to_string(),
                }
            })?),
        };

        // 4. Date and time formats
        let fecha_ingreso = match field(record, columns, "fecha_ingreso") {
            "" => None,
            value => Some(parse_date(value).ok_or_else(|| RowError::InvalidDateFormat {
                field: "fecha_ingreso",
                value: value.to_string(),
            })?),
        };

        let hora_ingreso = match field(record, columns, "hora_ingreso") {
            "" => None,
            value => Some(parse_time(value).ok_or_else(|| RowError::InvalidTimeFormat {
                field: "hora_ingreso",
                value: value.to_string(),
            })?),
        };

        // 5. Boolean-like fields are coerced, never rejected
        let tiene_mascotas = parse_flag(field(record, columns, "tiene_mascotas"));
        let grupo_jefe = parse_flag(field(record, columns, "grupo_jefe"));

        Ok(ValidatedPersonRecord {
            identity: IdentityFields {
                nombre_preferido: field(record, columns, "nombre_preferido").to_string(),
                edad_rango,
                genero,
                idioma_principal: optional(record, columns, "idioma_principal"),
            },
            group: GroupFields {
                grupo_jefe,
                grupo_id_externo: optional(record, columns, "grupo_id_externo"),
                relacion_con_jefe: optional(record, columns, "relacion_con_jefe"),
            },
            health: HealthFields {
                condicion_medica: optional(record, columns, "condicion_medica"),
                medicamentos: optional(record, columns, "medicamentos"),
                alergias: optional(record, columns, "alergias"),
                asistencia_especial: optional(record, columns, "asistencia_especial"),
            },
            origin: OriginFields {
                localidad: field(record, columns, "localidad").to_string(),
                situacion,
                tiene_mascotas,
                mascotas_detalle: optional(record, columns, "mascotas_detalle"),
            },
            entry: EntryFields {
                fecha_ingreso,
                hora_ingreso,
                area_asignada: field(record, columns, "area_asignada").to_string(),
                estatus,
                observaciones: None,
            },
        })
    }
}

impl Default for RowValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIELD HELPERS
// ============================================================================

/// Trimmed field value, or "" when the header does not carry the column.
fn field<'a>(record: &'a StringRecord, columns: &ColumnMap, column: &str) -> &'a str {
    columns
        .index_of(column)
        .and_then(|index| record.get(index))
        .unwrap_or("")
        .trim()
}

fn optional(record: &StringRecord, columns: &ColumnMap, column: &str) -> Option<String> {
    match field(record, columns, column) {
        "" => None,
        value => Some(value.to_string()),
    }
}

fn parse_enum<T>(
    record: &StringRecord,
    columns: &ColumnMap,
    column: &'static str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, RowError> {
    let value = field(record, columns, column);
    parse(value).ok_or_else(|| RowError::InvalidEnumValue {
        field: column,
        value: value.to_string(),
    })
}

/// Calendar dates arrive as YYYY-MM-DD, with DD/MM/YYYY tolerated from older
/// export tooling.
fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
}

/// Strict HH:MM:SS, two digits each.
fn parse_time(value: &str) -> Option<NaiveTime> {
    if value.len() != 8 {
        return None;
    }
    NaiveTime::parse_from_str(value, "%H:%M:%S").ok()
}

/// Case-insensitive "true"/"1" → true; anything else → false.
fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructureValidator;

    const TEST_HEADER: &str =
        "nombre_preferido,edad_rango,genero,idioma_principal,localidad,situacion,tiene_mascotas,mascotas_detalle,fecha_ingreso,hora_ingreso,area_asignada,estatus";

    fn column_map(header: &str) -> ColumnMap {
        StructureValidator::new()
            .validate(format!("{header}\n").as_bytes())
            .unwrap()
    }

    fn validate(header: &str, fields: &[&str]) -> Result<ValidatedPersonRecord, RowError> {
        let record = StringRecord::from(fields.to_vec());
        let row = CsvRow {
            row_number: 2,
            record: &record,
        };
        RowValidator::new().validate(&row, &column_map(header))
    }

    #[test]
    fn test_valid_row() {
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "F", "Español", "Ciudad X", "Vivienda perdida", "true",
                "2 perros", "2025-11-03", "14:30:00", "Area-1", "Alojado",
            ],
        );

        let record = result.unwrap();
        assert_eq!(record.identity.nombre_preferido, "Ana");
        assert_eq!(record.identity.edad_rango, AgeRange::Adult);
        assert_eq!(record.identity.genero, Gender::Female);
        assert_eq!(record.origin.situacion, Situation::HousingLost);
        assert!(record.origin.tiene_mascotas);
        assert_eq!(
            record.entry.fecha_ingreso,
            NaiveDate::from_ymd_opt(2025, 11, 3)
        );
        assert_eq!(record.entry.estatus, Some(EntryStatus::Housed));
    }

    #[test]
    fn test_column_count_mismatch() {
        let result = validate(TEST_HEADER, &["Ana", "Adulto", "F"]);

        assert_eq!(
            result.unwrap_err(),
            RowError::ColumnCountMismatch {
                expected: 12,
                found: 3
            }
        );
    }

    #[test]
    fn test_missing_required_field() {
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "", "F", "", "Ciudad X", "Vivienda perdida", "", "", "", "", "Area-1",
                "",
            ],
        );

        let err = result.unwrap_err();
        assert_eq!(err, RowError::MissingRequiredField("edad_rango"));
        assert_eq!(err.to_string(), "Missing required field: edad_rango");
    }

    #[test]
    fn test_invalid_genero_message() {
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "Invalido", "", "Ciudad X", "Vivienda perdida", "", "", "",
                "", "Area-1", "",
            ],
        );

        let err = result.unwrap_err();
        assert_eq!(
            err,
            RowError::InvalidEnumValue {
                field: "genero",
                value: "Invalido".to_string()
            }
        );
        assert_eq!(err.to_string(), "Invalid genero");
    }

    #[test]
    fn test_invalid_estatus_rejected_when_present() {
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", "", "", "", "",
                "Area-1", "Fugado",
            ],
        );

        assert!(matches!(
            result.unwrap_err(),
            RowError::InvalidEnumValue { field: "estatus", .. }
        ));
    }

    #[test]
    fn test_empty_estatus_defaults_to_none() {
        let record = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", "", "", "", "",
                "Area-1", "",
            ],
        )
        .unwrap();

        assert_eq!(record.entry.estatus, None);
    }

    #[test]
    fn test_invalid_date_format() {
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", "", "",
                "03-11-2025", "", "Area-1", "",
            ],
        );

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            RowError::InvalidDateFormat { field: "fecha_ingreso", .. }
        ));
        assert_eq!(err.to_string(), "Invalid fecha_ingreso format");
    }

    #[test]
    fn test_date_accepts_both_formats() {
        for date in ["2025-11-03", "03/11/2025"] {
            let record = validate(
                TEST_HEADER,
                &[
                    "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", "", "", date,
                    "", "Area-1", "",
                ],
            )
            .unwrap();

            assert_eq!(
                record.entry.fecha_ingreso,
                NaiveDate::from_ymd_opt(2025, 11, 3)
            );
        }
    }

    #[test]
    fn test_time_must_be_strict_hhmmss() {
        // Single-digit hour is rejected even though it names a real time
        let result = validate(
            TEST_HEADER,
            &[
                "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", "", "", "",
                "7:30:00", "Area-1", "",
            ],
        );

        assert!(matches!(
            result.unwrap_err(),
            RowError::InvalidTimeFormat { field: "hora_ingreso", .. }
        ));
    }

    #[test]
    fn test_boolean_coercion_never_fails() {
        for (raw, expected) in [("true", true), ("TRUE", true), ("1", true), ("yes", false), ("", false)] {
            let record = validate(
                TEST_HEADER,
                &[
                    "Ana", "Adulto", "F", "", "Ciudad X", "Vivienda perdida", raw, "", "",
                    "", "Area-1", "",
                ],
            )
            .unwrap();

            assert_eq!(record.origin.tiene_mascotas, expected, "value: {raw:?}");
        }
    }

    #[test]
    fn test_validation_short_circuits_in_rule_order() {
        // Missing required field wins over the bad enum later in the row
        let result = validate(
            TEST_HEADER,
            &[
                "", "Adulto", "Invalido", "", "Ciudad X", "Vivienda perdida", "", "", "",
                "", "Area-1", "",
            ],
        );

        assert_eq!(
            result.unwrap_err(),
            RowError::MissingRequiredField("nombre_preferido")
        );
    }

    #[test]
    fn test_absent_optional_columns_yield_none() {
        let header = "nombre_preferido,edad_rango,genero,localidad,situacion,area_asignada";
        let record = validate(
            header,
            &["Ana", "Adulto", "F", "Ciudad X", "Vivienda perdida", "Area-1"],
        )
        .unwrap();

        assert_eq!(record.health.condicion_medica, None);
        assert_eq!(record.entry.fecha_ingreso, None);
        assert!(!record.origin.tiene_mascotas);
    }
}

use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Identity is not part of the statement;
/// the session supplies it.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        user: User,
    },
    CreateSlot {
        slot: NewSlot,
        returning: bool,
    },
    ListAvailable {
        filter: SlotFilter,
    },
    ListMySlots,
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
        returning: bool,
    },
    DeleteSlot {
        id: Ulid,
    },
    Book {
        slot_id: Ulid,
        returning: bool,
    },
    ListMyBookings,
    CancelBooking {
        id: Ulid,
    },
}

const USER_COLUMNS: &[&str] = &["id", "name", "email", "role"];
const SLOT_COLUMNS: &[&str] = &["subject", "description", "start_time", "end_time", "capacity"];
const BOOKING_COLUMNS: &[&str] = &["slot_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "users" => {
            let row = named_values(insert, USER_COLUMNS)?;
            let role = parse_string(require(&row, "users", "role")?)?;
            Ok(Command::RegisterUser {
                user: User {
                    id: parse_ulid_expr(require(&row, "users", "id")?)?,
                    name: parse_string(require(&row, "users", "name")?)?,
                    email: parse_string(require(&row, "users", "email")?)?,
                    role: Role::parse(&role)
                        .ok_or_else(|| SqlError::Parse(format!("bad role: {role}")))?,
                },
            })
        }
        "slots" => {
            let row = named_values(insert, SLOT_COLUMNS)?;
            Ok(Command::CreateSlot {
                slot: NewSlot {
                    subject: parse_string(require(&row, "slots", "subject")?)?,
                    description: row
                        .get("description")
                        .map(parse_string_or_null)
                        .transpose()?
                        .flatten(),
                    start_time: parse_instant(require(&row, "slots", "start_time")?)?,
                    end_time: parse_instant(require(&row, "slots", "end_time")?)?,
                    capacity: row
                        .get("capacity")
                        .map(parse_u32_or_null)
                        .transpose()?
                        .flatten(),
                },
                returning,
            })
        }
        "bookings" => {
            let row = named_values(insert, BOOKING_COLUMNS)?;
            Ok(Command::Book {
                slot_id: parse_ulid_expr(require(&row, "bookings", "slot_id")?)?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "slots" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut patch = SlotPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(col) => object_name_last(col),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "subject" => patch.subject = Some(parse_string(value)?),
            "description" => patch.description = Some(parse_string(value)?),
            "start_time" => patch.start_time = Some(parse_instant(value)?),
            "end_time" => patch.end_time = Some(parse_instant(value)?),
            "capacity" => patch.capacity = Some(parse_u32(value)?),
            "status" => {
                let s = parse_string(value)?;
                patch.status = Some(
                    SlotStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                );
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    Ok(Command::UpdateSlot {
        id: extract_where_id(selection)?,
        patch,
        returning,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        // Cancels; the booking row is kept.
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "available_slots" => {
            let mut filter = SlotFilter::default();
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut filter)?;
            }
            Ok(Command::ListAvailable { filter })
        }
        "my_slots" => Ok(Command::ListMySlots),
        "my_bookings" => Ok(Command::ListMyBookings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_slot_filters(expr: &Expr, filter: &mut SlotFilter) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_slot_filters(inner, filter),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, filter)?;
                extract_slot_filters(right, filter)
            }
            ast::BinaryOperator::Eq => {
                match expr_column_name(left).as_deref() {
                    Some("date") => {
                        let s = parse_string(right)?;
                        filter.date = Some(
                            s.parse()
                                .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))?,
                        );
                    }
                    Some("tutor_id") => filter.tutor_id = Some(parse_ulid_expr(right)?),
                    Some("subject") => filter.subject = Some(parse_string(right)?),
                    Some(other) => return Err(SqlError::UnknownColumn(other.to_string())),
                    None => return Err(SqlError::Unsupported(format!("{expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("{expr}"))),
        },
        Expr::ILike {
            negated: false,
            expr: column,
            pattern,
            ..
        }
        | Expr::Like {
            negated: false,
            expr: column,
            pattern,
            ..
        } => {
            if expr_column_name(column).as_deref() != Some("subject") {
                return Err(SqlError::Unsupported(format!("{expr}")));
            }
            let pattern = parse_string(pattern)?;
            filter.subject = Some(pattern.trim_matches('%').to_string());
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("{expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row of an INSERT, keyed by column. Without a column
/// list, values are positional over `defaults`.
fn named_values(
    insert: &ast::Insert,
    defaults: &[&str],
) -> Result<HashMap<String, Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let [row] = rows.as_slice() else {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        if row.len() > defaults.len() {
            return Err(SqlError::WrongArity(defaults.len(), row.len()));
        }
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != row.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut out = HashMap::with_capacity(row.len());
    for (column, value) in columns.into_iter().zip(row) {
        if !defaults.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        out.insert(column, value.clone());
    }
    Ok(out)
}

fn require<'a>(
    row: &'a HashMap<String, Expr>,
    table: &'static str,
    column: &'static str,
) -> Result<&'a Expr, SqlError> {
    row.get(column)
        .ok_or(SqlError::MissingColumn { table, column })
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, either as an integer or an RFC 3339 string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u32(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{table}: missing column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_register_user() {
        let sql = format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{ID}', 'Ada', 'ada@example.com', 'student')"
        );
        match parse_sql(&sql).unwrap() {
            Command::RegisterUser { user } => {
                assert_eq!(user.id.to_string(), ID);
                assert_eq!(user.name, "Ada");
                assert_eq!(user.role, Role::Student);
            }
            cmd => panic!("expected RegisterUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_register_user_bad_role() {
        let sql = format!("INSERT INTO users VALUES ('{ID}', 'Ada', 'ada@example.com', 'admin')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_create_slot_positional_with_defaults() {
        let sql = "INSERT INTO slots VALUES ('Calculus', NULL, 1800000000000, 1800003600000)";
        match parse_sql(sql).unwrap() {
            Command::CreateSlot { slot, returning } => {
                assert_eq!(slot.subject, "Calculus");
                assert_eq!(slot.description, None);
                assert_eq!(slot.start_time, 1_800_000_000_000);
                assert_eq!(slot.end_time, 1_800_003_600_000);
                assert_eq!(slot.capacity, None);
                assert!(!returning);
            }
            cmd => panic!("expected CreateSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_create_slot_named_columns_and_rfc3339() {
        let sql = "INSERT INTO slots (start_time, end_time, subject, capacity) \
                   VALUES ('2027-01-15T08:00:00Z', '2027-01-15T09:30:00+00:00', 'Physics', 3) RETURNING *";
        match parse_sql(sql).unwrap() {
            Command::CreateSlot { slot, returning } => {
                assert_eq!(slot.start_time, 1_800_000_000_000);
                assert_eq!(slot.end_time, 1_800_000_000_000 + 90 * 60_000);
                assert_eq!(slot.capacity, Some(3));
                assert!(returning);
            }
            cmd => panic!("expected CreateSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_create_slot_requires_times() {
        let sql = "INSERT INTO slots (subject) VALUES ('Physics')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn {
                column: "start_time",
                ..
            })
        ));
    }

    #[test]
    fn parse_create_slot_unknown_column() {
        let sql = "INSERT INTO slots (subject, room) VALUES ('Physics', 'B12')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "room"));
    }

    #[test]
    fn parse_book() {
        let sql = format!("INSERT INTO bookings (slot_id) VALUES ('{ID}') RETURNING *");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Book {
                slot_id: Ulid::from_string(ID).unwrap(),
                returning: true,
            }
        );
    }

    #[test]
    fn parse_cancel_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CancelBooking { .. }));
    }

    #[test]
    fn parse_delete_slot() {
        let sql = format!("DELETE FROM slots WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteSlot { .. }));
    }

    #[test]
    fn parse_delete_without_id_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM slots WHERE subject = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_slot() {
        let sql = format!(
            "UPDATE slots SET subject = 'Algebra II', capacity = 4, status = 'cancelled' WHERE id = '{ID}' RETURNING *"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateSlot {
                id,
                patch,
                returning,
            } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(patch.subject.as_deref(), Some("Algebra II"));
                assert_eq!(patch.capacity, Some(4));
                assert_eq!(patch.status, Some(SlotStatus::Cancelled));
                assert_eq!(patch.start_time, None);
                assert!(returning);
            }
            cmd => panic!("expected UpdateSlot, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_rejects_unknown_column() {
        let sql = format!("UPDATE slots SET tutor_id = '{ID}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_available_slots_filters() {
        let sql = format!(
            "SELECT * FROM available_slots WHERE date = '2027-01-15' AND subject ILIKE '%calc%' AND tutor_id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::ListAvailable { filter } => {
                assert_eq!(filter.date, Some("2027-01-15".parse().unwrap()));
                assert_eq!(filter.subject.as_deref(), Some("calc"));
                assert_eq!(filter.tutor_id.map(|t| t.to_string()).as_deref(), Some(ID));
            }
            cmd => panic!("expected ListAvailable, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_available_slots_unfiltered() {
        assert_eq!(
            parse_sql("SELECT * FROM available_slots").unwrap(),
            Command::ListAvailable {
                filter: SlotFilter::default()
            }
        );
    }

    #[test]
    fn parse_bad_date_errors() {
        let sql = "SELECT * FROM available_slots WHERE date = '15/01/2027'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_my_views() {
        assert_eq!(parse_sql("SELECT * FROM my_slots").unwrap(), Command::ListMySlots);
        assert_eq!(
            parse_sql("select * from MY_BOOKINGS").unwrap(),
            Command::ListMyBookings
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO payments (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}

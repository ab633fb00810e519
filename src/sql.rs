use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SLOTS_JSON_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEvent {
        event: NewEvent,
        slots: Vec<NewTimeSlot>,
    },
    SelectEvents,
    SelectEvent {
        id: Ulid,
    },
    SelectEventsWithSlots,
    UpdateEvent {
        id: Ulid,
        patch: EventPatch,
    },
    DeleteEvent {
        id: Ulid,
    },
    SelectTimeSlot {
        id: Ulid,
    },
    SelectTimeSlots {
        event_id: Ulid,
    },
    UpdateSlotCounter {
        id: Ulid,
        current_bookings: u32,
    },
    InsertBooking {
        request: BookingRequest,
    },
    SelectBookingsByEmail {
        attendee_email: String,
    },
    SelectBookingsByEvent {
        event_id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
        attendee_email: String,
    },
}

/// Row layout a statement produces, known before its parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Command tag only.
    Empty,
    Event,
    EventWithSlots,
    TimeSlot,
    Booking,
    /// Booking row plus the confirmation message.
    Admitted,
}

impl Command {
    pub fn shape(&self) -> ResultShape {
        match self {
            Command::InsertEvent { .. }
            | Command::SelectEvent { .. }
            | Command::SelectEventsWithSlots => ResultShape::EventWithSlots,
            Command::SelectEvents | Command::UpdateEvent { .. } => ResultShape::Event,
            Command::SelectTimeSlot { .. } | Command::SelectTimeSlots { .. } => {
                ResultShape::TimeSlot
            }
            Command::InsertBooking { .. } => ResultShape::Admitted,
            Command::SelectBookingsByEmail { .. }
            | Command::SelectBookingsByEvent { .. } => ResultShape::Booking,
            Command::DeleteEvent { .. }
            | Command::UpdateSlotCounter { .. }
            | Command::DeleteBooking { .. } => ResultShape::Empty,
        }
    }
}

const EVENT_INSERT_COLUMNS: &[&str] = &[
    "title",
    "description",
    "creator_name",
    "creator_email",
    "time_slots",
];
const BOOKING_INSERT_COLUMNS: &[&str] = &[
    "event_id",
    "time_slot_id",
    "attendee_name",
    "attendee_email",
];
const EVENT_UPDATE_COLUMNS: &[&str] = &["title", "description", "creator_name", "creator_email"];

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table, &assignments, &selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result layout of a statement that may still contain `$n` placeholders.
pub fn describe(sql: &str) -> Result<ResultShape, SqlError> {
    let shape = match parse_statement(sql)? {
        Statement::Insert(insert) => match insert_table_name(&insert)?.as_str() {
            "events" => ResultShape::EventWithSlots,
            "bookings" => ResultShape::Admitted,
            other => return Err(SqlError::UnknownTable(other.into())),
        },
        Statement::Query(query) => {
            let (table, filters) = select_target(&query)?;
            route_select(&table, &filters)?.shape()
        }
        Statement::Update { table, .. } => match table_factor_name(&table.relation)?.as_str() {
            "events" => ResultShape::Event,
            "time_slots" => ResultShape::Empty,
            other => return Err(SqlError::UnknownTable(other.into())),
        },
        Statement::Delete(_) => ResultShape::Empty,
        other => return Err(SqlError::Unsupported(format!("{other}"))),
    };
    Ok(shape)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "events" => {
            let fields = insert_fields(insert, EVENT_INSERT_COLUMNS)?;
            let event = NewEvent {
                title: string_field(&fields, "title")?,
                description: string_field(&fields, "description")?,
                creator_name: string_field(&fields, "creator_name")?,
                creator_email: string_field(&fields, "creator_email")?,
            };
            let slots = parse_slots_json(&string_field(&fields, "time_slots")?)?;
            Ok(Command::InsertEvent { event, slots })
        }
        "bookings" => {
            let fields = insert_fields(insert, BOOKING_INSERT_COLUMNS)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    event_id: parse_ulid_expr(field(&fields, "event_id")?)?,
                    time_slot_id: parse_ulid_expr(field(&fields, "time_slot_id")?)?,
                    attendee_name: string_field(&fields, "attendee_name")?,
                    attendee_email: string_field(&fields, "attendee_email")?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "events" => {
            let mut patch = EventPatch::default();
            for (column, value) in sets {
                if !EVENT_UPDATE_COLUMNS.contains(&column.as_str()) {
                    return Err(SqlError::UnknownColumn(column));
                }
                let value = Some(parse_string_expr(value)?);
                match column.as_str() {
                    "title" => patch.title = value,
                    "description" => patch.description = value,
                    "creator_name" => patch.creator_name = value,
                    _ => patch.creator_email = value,
                }
            }
            Ok(Command::UpdateEvent { id, patch })
        }
        "time_slots" => {
            let mut current_bookings = None;
            for (column, value) in sets {
                if column != "current_bookings" {
                    return Err(SqlError::UnknownColumn(column));
                }
                current_bookings = Some(parse_u32(value)?);
            }
            Ok(Command::UpdateSlotCounter {
                id,
                current_bookings: current_bookings
                    .ok_or(SqlError::MissingColumn("current_bookings"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "events" => Ok(Command::DeleteEvent {
            id: extract_where_id(&delete.selection)?,
        }),
        "bookings" => {
            let filters = equality_filters(&delete.selection);
            let id = filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?;
            let email = filter(&filters, "attendee_email")
                .ok_or(SqlError::MissingFilter("attendee_email"))?;
            Ok(Command::DeleteBooking {
                id: parse_ulid_expr(id)?,
                attendee_email: parse_string_expr(email)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Which read a SELECT resolves to. Both execution and describe go through
/// here so a statement's row layout never depends on its bound values.
enum SelectRoute<'a> {
    Events,
    Event(&'a Expr),
    EventsWithSlots,
    TimeSlot(&'a Expr),
    TimeSlots(&'a Expr),
    BookingsByEmail(&'a Expr),
    BookingsByEvent(&'a Expr),
}

fn route_select<'a>(
    table: &str,
    filters: &[(String, &'a Expr)],
) -> Result<SelectRoute<'a>, SqlError> {
    match table {
        "events" => Ok(match filter(filters, "id") {
            Some(id) => SelectRoute::Event(id),
            None => SelectRoute::Events,
        }),
        "events_with_slots" => Ok(SelectRoute::EventsWithSlots),
        "time_slots" => {
            if let Some(id) = filter(filters, "id") {
                Ok(SelectRoute::TimeSlot(id))
            } else if let Some(event_id) = filter(filters, "event_id") {
                Ok(SelectRoute::TimeSlots(event_id))
            } else {
                Err(SqlError::MissingFilter("id or event_id"))
            }
        }
        "bookings" => {
            if let Some(email) = filter(filters, "attendee_email") {
                Ok(SelectRoute::BookingsByEmail(email))
            } else if let Some(event_id) = filter(filters, "event_id") {
                Ok(SelectRoute::BookingsByEvent(event_id))
            } else {
                Err(SqlError::MissingFilter("attendee_email or event_id"))
            }
        }
        _ => Err(SqlError::UnknownTable(table.into())),
    }
}

impl SelectRoute<'_> {
    fn shape(&self) -> ResultShape {
        match self {
            SelectRoute::Events => ResultShape::Event,
            SelectRoute::Event(_) | SelectRoute::EventsWithSlots => ResultShape::EventWithSlots,
            SelectRoute::TimeSlot(_) | SelectRoute::TimeSlots(_) => ResultShape::TimeSlot,
            SelectRoute::BookingsByEmail(_) | SelectRoute::BookingsByEvent(_) => {
                ResultShape::Booking
            }
        }
    }

    fn into_command(self) -> Result<Command, SqlError> {
        Ok(match self {
            SelectRoute::Events => Command::SelectEvents,
            SelectRoute::Event(id) => Command::SelectEvent {
                id: parse_ulid_expr(id)?,
            },
            SelectRoute::EventsWithSlots => Command::SelectEventsWithSlots,
            SelectRoute::TimeSlot(id) => Command::SelectTimeSlot {
                id: parse_ulid_expr(id)?,
            },
            SelectRoute::TimeSlots(event_id) => Command::SelectTimeSlots {
                event_id: parse_ulid_expr(event_id)?,
            },
            SelectRoute::BookingsByEmail(email) => Command::SelectBookingsByEmail {
                attendee_email: parse_string_expr(email)?,
            },
            SelectRoute::BookingsByEvent(event_id) => Command::SelectBookingsByEvent {
                event_id: parse_ulid_expr(event_id)?,
            },
        })
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (table, filters) = select_target(query)?;
    route_select(&table, &filters)?.into_command()
}

fn select_target(query: &ast::Query) -> Result<(String, Vec<(String, &Expr)>), SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    Ok((table, equality_filters(&select.selection)))
}

// ── Slots JSON ────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawSlot {
    start_time: String,
    end_time: String,
    max_bookings: i64,
}

fn parse_slots_json(json: &str) -> Result<Vec<NewTimeSlot>, SqlError> {
    if json.len() > MAX_SLOTS_JSON_LEN {
        return Err(SqlError::InvalidValue(format!(
            "time_slots exceeds {MAX_SLOTS_JSON_LEN} bytes"
        )));
    }
    let raw: Vec<RawSlot> = serde_json::from_str(json)
        .map_err(|e| SqlError::InvalidValue(format!("time_slots: {e}")))?;
    raw.into_iter()
        .enumerate()
        .map(|(i, s)| {
            let max_bookings = u32::try_from(s.max_bookings).map_err(|_| {
                SqlError::InvalidValue(format!(
                    "time_slots[{i}].max_bookings: {} out of range",
                    s.max_bookings
                ))
            })?;
            Ok(NewTimeSlot {
                start_time: parse_timestamp(&s.start_time)
                    .map_err(|e| SqlError::InvalidValue(format!("time_slots[{i}].start_time: {e}")))?,
                end_time: parse_timestamp(&s.end_time)
                    .map_err(|e| SqlError::InvalidValue(format!("time_slots[{i}].end_time: {e}")))?,
                max_bookings,
            })
        })
        .collect()
}

/// RFC 3339, or a naive ISO 8601 datetime taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<Timestamp, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("bad timestamp: {s:?}"))
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Pair VALUES with their column names. Without a column list the values are
/// taken in `default_order`.
fn insert_fields(
    insert: &ast::Insert,
    default_order: &[&'static str],
) -> Result<Vec<(String, Expr)>, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| ident.value.to_lowercase())
            .collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    for column in &columns {
        if !default_order.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column.clone()));
        }
    }
    Ok(columns.into_iter().zip(values).collect())
}

fn field<'a>(fields: &'a [(String, Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    fields
        .iter()
        .find(|(c, _)| c == column)
        .map(|(_, e)| e)
        .ok_or(SqlError::MissingColumn(column))
}

fn string_field(fields: &[(String, Expr)], column: &'static str) -> Result<String, SqlError> {
    parse_string_expr(field(fields, column)?)
}

/// `col = value` conjuncts of a WHERE clause. Anything else is ignored.
fn equality_filters(selection: &Option<Expr>) -> Vec<(String, &Expr)> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    walk(left, out);
                    walk(right, out);
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        out.push((col, right));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out);
    }
    out
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = equality_filters(selection);
    let id = filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?;
    parse_ulid_expr(id)
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::EscapedStringLiteral(s)) => {
            Ok(s.clone())
        }
        Some(Value::Null) => Err(SqlError::InvalidValue("NULL is not allowed here".into())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ulid::from_string(s)
                .map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the column can't hold.
    InvalidValue(String),
}

impl SqlError {
    /// True for errors about the values supplied rather than the statement.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            SqlError::UnknownColumn(_) | SqlError::MissingColumn(_) | SqlError::InvalidValue(_)
        )
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_insert_event_with_slots() {
        let sql = r#"INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('Office hours', 'Bring questions', 'Grace', 'grace@example.com', '[{"start_time": "2030-01-01T10:00:00Z", "end_time": "2030-01-01T11:00:00Z", "max_bookings": 2}, {"start_time": "2030-01-01T12:00:00", "end_time": "2030-01-01 13:00:00", "max_bookings": 1}]')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertEvent { event, slots } => {
                assert_eq!(event.title, "Office hours");
                assert_eq!(event.creator_email, "grace@example.com");
                assert_eq!(slots.len(), 2);
                assert_eq!(slots[0].max_bookings, 2);
                assert_eq!(slots[0].start_time.to_rfc3339(), "2030-01-01T10:00:00+00:00");
                // Naive timestamps are taken as UTC
                assert_eq!(slots[1].end_time.to_rfc3339(), "2030-01-01T13:00:00+00:00");
            }
            _ => panic!("expected InsertEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_event_positional() {
        let sql = r#"INSERT INTO events VALUES ('T', 'D', 'N', 'n@example.com', '[{"start_time": "2030-01-01T10:00:00Z", "end_time": "2030-01-01T11:00:00Z", "max_bookings": 3}]')"#;
        let cmd = parse_sql(sql).unwrap();
        assert!(matches!(cmd, Command::InsertEvent { ref slots, .. } if slots.len() == 1));
    }

    #[test]
    fn parse_insert_event_bad_json_is_invalid_input() {
        let sql = "INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('T', 'D', 'N', 'n@example.com', 'not json')";
        let err = parse_sql(sql).unwrap_err();
        assert!(err.is_invalid_input(), "{err}");
    }

    #[test]
    fn parse_insert_event_negative_capacity_is_invalid_input() {
        let sql = r#"INSERT INTO events (title, description, creator_name, creator_email, time_slots) VALUES ('T', 'D', 'N', 'n@example.com', '[{"start_time": "2030-01-01T10:00:00Z", "end_time": "2030-01-01T11:00:00Z", "max_bookings": -1}]')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_insert_event_unknown_column() {
        let sql = "INSERT INTO events (title, venue) VALUES ('T', 'Hall')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "venue"));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ('{ID}', '{ID}', 'Ada', 'ada@example.com')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { request } => {
                assert_eq!(request.event_id.to_string(), ID);
                assert_eq!(request.attendee_name, "Ada");
                assert_eq!(request.attendee_email, "ada@example.com");
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_missing_column() {
        let sql = format!(
            "INSERT INTO bookings (event_id, time_slot_id, attendee_name) VALUES ('{ID}', '{ID}', 'Ada')"
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("attendee_email"))
        ));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = format!(
            "INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ('{ID}', '{ID}', 'A', 'a@example.com'), ('{ID}', '{ID}', 'B', 'b@example.com')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_events() {
        assert_eq!(parse_sql("SELECT * FROM events").unwrap(), Command::SelectEvents);
        assert_eq!(
            parse_sql("SELECT * FROM events_with_slots").unwrap(),
            Command::SelectEventsWithSlots
        );
        let cmd = parse_sql(&format!("SELECT * FROM events WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectEvent { id } if id.to_string() == ID));
    }

    #[test]
    fn parse_select_time_slots() {
        let cmd = parse_sql(&format!("SELECT * FROM time_slots WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectTimeSlot { .. }));
        let cmd = parse_sql(&format!("SELECT * FROM time_slots WHERE event_id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectTimeSlots { .. }));
        assert!(matches!(
            parse_sql("SELECT * FROM time_slots"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_bookings() {
        let cmd =
            parse_sql("SELECT * FROM bookings WHERE attendee_email = 'ada@example.com'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookingsByEmail {
                attendee_email: "ada@example.com".into()
            }
        );
        let cmd = parse_sql(&format!("SELECT * FROM bookings WHERE event_id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::SelectBookingsByEvent { .. }));
    }

    #[test]
    fn parse_update_event() {
        let sql = format!("UPDATE events SET title = 'Renamed', description = 'New' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateEvent { id, patch } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(patch.title.as_deref(), Some("Renamed"));
                assert_eq!(patch.description.as_deref(), Some("New"));
                assert_eq!(patch.creator_name, None);
            }
            _ => panic!("expected UpdateEvent, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_event_rejects_immutable_columns() {
        let sql = format!("UPDATE events SET created_at = '2030-01-01T00:00:00Z' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_event_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE events SET title = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_slot_counter() {
        let sql = format!("UPDATE time_slots SET current_bookings = 7 WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(
            cmd,
            Command::UpdateSlotCounter {
                current_bookings: 7,
                ..
            }
        ));
        let sql = format!("UPDATE time_slots SET current_bookings = -1 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_delete_event() {
        let cmd = parse_sql(&format!("DELETE FROM events WHERE id = '{ID}'")).unwrap();
        assert!(matches!(cmd, Command::DeleteEvent { .. }));
    }

    #[test]
    fn parse_delete_booking_requires_email() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}' AND attendee_email = 'ada@example.com'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DeleteBooking { attendee_email, .. } => {
                assert_eq!(attendee_email, "ada@example.com")
            }
            _ => panic!("expected DeleteBooking, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")),
            Err(SqlError::MissingFilter("attendee_email"))
        ));
    }

    #[test]
    fn bad_ulid_is_invalid_input() {
        let err = parse_sql("SELECT * FROM events WHERE id = 'nope'").unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn describe_with_placeholders() {
        assert_eq!(
            describe("SELECT * FROM events WHERE id = $1").unwrap(),
            ResultShape::EventWithSlots
        );
        assert_eq!(describe("SELECT * FROM events").unwrap(), ResultShape::Event);
        assert_eq!(
            describe("INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ($1, $2, $3, $4)").unwrap(),
            ResultShape::Booking
        );
        assert_eq!(
            describe("DELETE FROM bookings WHERE id = $1 AND attendee_email = $2").unwrap(),
            ResultShape::Empty
        );
        assert_eq!(
            describe("UPDATE events SET title = $1 WHERE id = $2").unwrap(),
            ResultShape::Event
        );
    }

    #[test]
    fn command_shape_matches_describe() {
        let statements = [
            "SELECT * FROM events".to_string(),
            format!("SELECT * FROM events WHERE id = '{ID}'"),
            format!("SELECT * FROM events WHERE title = 'Workshop'"),
            format!("SELECT * FROM events WHERE title = 'Workshop' AND id = '{ID}'"),
            "SELECT * FROM events_with_slots".to_string(),
            format!("SELECT * FROM time_slots WHERE id = '{ID}'"),
            format!("SELECT * FROM time_slots WHERE event_id = '{ID}'"),
            format!("SELECT * FROM bookings WHERE attendee_email = 'a@x.com'"),
            format!("SELECT * FROM bookings WHERE event_id = '{ID}'"),
            format!(
                "INSERT INTO bookings (event_id, time_slot_id, attendee_name, attendee_email) VALUES ('{ID}', '{ID}', 'A', 'a@x.com')"
            ),
            format!("UPDATE events SET title = 'T' WHERE id = '{ID}'"),
            format!("UPDATE time_slots SET current_bookings = 2 WHERE id = '{ID}'"),
            format!("DELETE FROM events WHERE id = '{ID}'"),
            format!("DELETE FROM bookings WHERE id = '{ID}' AND attendee_email = 'a@x.com'"),
        ];
        for sql in &statements {
            assert_eq!(parse_sql(sql).unwrap().shape(), describe(sql).unwrap(), "{sql}");
        }
    }

    #[test]
    fn describe_routes_filtered_events_like_execution() {
        assert_eq!(
            describe("SELECT * FROM events WHERE title = $1").unwrap(),
            ResultShape::Event
        );
        assert_eq!(
            describe("SELECT * FROM events WHERE id = $1").unwrap(),
            ResultShape::EventWithSlots
        );
        assert!(matches!(
            describe("SELECT * FROM time_slots WHERE status = $1"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_timestamp_formats() {
        assert!(parse_timestamp("2030-01-01T10:00:00+02:00").is_ok());
        assert!(parse_timestamp("2030-01-01T10:00:00.250").is_ok());
        assert!(parse_timestamp("tomorrow").is_err());
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM resources"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}

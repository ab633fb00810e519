use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError, ErrorClass};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape, SqlError};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.dispatch(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        let shape = cmd.shape();
        match cmd {
            Command::InsertEvent { event, slots } => {
                let created = engine.create_event(event, slots).await.map_err(engine_err)?;
                query_response(shape, [created], encode_event_with_slots)
            }
            Command::SelectEvents => {
                let events = engine.list_events().await;
                query_response(shape, events, encode_event)
            }
            Command::SelectEvent { id } => {
                let found = engine.get_event_by_id(id).await.map_err(engine_err)?;
                query_response(shape, [found], encode_event_with_slots)
            }
            Command::SelectEventsWithSlots => {
                let all = engine.list_events_with_slots().await.map_err(engine_err)?;
                query_response(shape, all, encode_event_with_slots)
            }
            Command::UpdateEvent { id, patch } => {
                let updated = engine.update_event(id, patch).await.map_err(engine_err)?;
                query_response(shape, [updated], encode_event)
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTimeSlot { id } => {
                let slot = engine.get_time_slot(id).await.map_err(engine_err)?;
                query_response(shape, [slot], encode_time_slot)
            }
            Command::SelectTimeSlots { event_id } => {
                let slots = engine.list_time_slots(event_id).await.map_err(engine_err)?;
                query_response(shape, slots, encode_time_slot)
            }
            Command::UpdateSlotCounter {
                id,
                current_bookings,
            } => {
                engine
                    .override_slot_counter(id, current_bookings)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertBooking { request } => {
                let admission = engine.attempt_booking(request).await.map_err(engine_err)?;
                if let Err(rejection) = admission {
                    return Err(engine_err(EngineError::Rejected(rejection)));
                }
                query_response(shape, [BookingResult::from(admission)], encode_booking_result)
            }
            Command::SelectBookingsByEmail { attendee_email } => {
                let found = engine.bookings_by_email(&attendee_email).await;
                query_response(shape, found, encode_booking)
            }
            Command::SelectBookingsByEvent { event_id } => {
                let found = engine.bookings_by_event(event_id).await;
                query_response(shape, found, encode_booking)
            }
            Command::DeleteBooking { id, attendee_email } => {
                if !engine
                    .cancel_booking(id, &attendee_email)
                    .await
                    .map_err(engine_err)?
                {
                    return Err(engine_err(EngineError::BookingNotFound(id)));
                }
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

const EVENT_COLUMNS: [&str; 7] = [
    "id",
    "title",
    "description",
    "creator_name",
    "creator_email",
    "created_at",
    "updated_at",
];

const BOOKING_COLUMNS: [&str; 9] = [
    "id",
    "event_id",
    "time_slot_id",
    "attendee_name",
    "attendee_email",
    "created_at",
    "event_title",
    "slot_start_time",
    "slot_end_time",
];

pub fn schema(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Empty => vec![],
        ResultShape::Event => EVENT_COLUMNS.iter().map(|c| text_field(c)).collect(),
        ResultShape::EventWithSlots => {
            let mut fields: Vec<_> = EVENT_COLUMNS.iter().map(|c| text_field(c)).collect();
            fields.push(text_field("time_slots"));
            fields
        }
        ResultShape::TimeSlot => vec![
            text_field("id"),
            text_field("event_id"),
            text_field("start_time"),
            text_field("end_time"),
            int_field("max_bookings"),
            text_field("status"),
            text_field("created_at"),
            int_field("current_bookings"),
        ],
        ResultShape::Booking => BOOKING_COLUMNS.iter().map(|c| text_field(c)).collect(),
        ResultShape::Admitted => {
            let mut fields: Vec<_> = BOOKING_COLUMNS.iter().map(|c| text_field(c)).collect();
            fields.push(text_field("message"));
            fields
        }
    }
}

fn query_response<T>(
    shape: ResultShape,
    items: impl IntoIterator<Item = T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema(shape));
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, &item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn ts(t: &Timestamp) -> String {
    t.to_rfc3339()
}

fn encode_event(encoder: &mut DataRowEncoder, event: &Event) -> PgWireResult<()> {
    encoder.encode_field(&event.id.to_string())?;
    encoder.encode_field(&event.title)?;
    encoder.encode_field(&event.description)?;
    encoder.encode_field(&event.creator_name)?;
    encoder.encode_field(&event.creator_email)?;
    encoder.encode_field(&ts(&event.created_at))?;
    encoder.encode_field(&ts(&event.updated_at))
}

fn encode_event_with_slots(
    encoder: &mut DataRowEncoder,
    composed: &EventWithSlots,
) -> PgWireResult<()> {
    encode_event(encoder, &composed.event)?;
    let slots = serde_json::to_string(&composed.time_slots)
        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    encoder.encode_field(&slots)
}

fn encode_time_slot(encoder: &mut DataRowEncoder, slot: &TimeSlot) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.event_id.to_string())?;
    encoder.encode_field(&ts(&slot.start_time))?;
    encoder.encode_field(&ts(&slot.end_time))?;
    encoder.encode_field(&i64::from(slot.max_bookings))?;
    encoder.encode_field(&slot.status)?;
    encoder.encode_field(&ts(&slot.created_at))?;
    encoder.encode_field(&i64::from(slot.current_bookings))
}

fn encode_booking(encoder: &mut DataRowEncoder, details: &BookingDetails) -> PgWireResult<()> {
    let b = &details.booking;
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.event_id.to_string())?;
    encoder.encode_field(&b.time_slot_id.to_string())?;
    encoder.encode_field(&b.attendee_name)?;
    encoder.encode_field(&b.attendee_email)?;
    encoder.encode_field(&ts(&b.created_at))?;
    encoder.encode_field(&details.event_title)?;
    encoder.encode_field(&ts(&details.slot_start_time))?;
    encoder.encode_field(&ts(&details.slot_end_time))
}

fn encode_booking_result(encoder: &mut DataRowEncoder, result: &BookingResult) -> PgWireResult<()> {
    let Some(details) = &result.booking else {
        return Err(user_error("XX000", result.message.clone()));
    };
    encode_booking(encoder, details)?;
    encoder.encode_field(&result.message)
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema(sql::describe(stmt).map_err(sql_err)?))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let shape = sql::describe(&target.statement).map_err(sql_err)?;
        Ok(DescribeStatementResponse::new(param_types, schema(shape)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let shape = sql::describe(&target.statement.statement).map_err(sql_err)?;
        Ok(DescribePortalResponse::new(schema(shape)))
    }
}

/// Walk `sql` once, handing each `$N` placeholder outside single-quoted
/// literals to `on_param` along with the byte range it covers.
fn scan_placeholders(sql: &str, mut on_param: impl FnMut(usize, std::ops::Range<usize>)) {
    let bytes = sql.as_bytes();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    on_param(n, start..i);
                }
            }
            _ => i += 1,
        }
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    scan_placeholders(sql, |n, _| max = max.max(n));
    max
}

/// Splice text-format parameters into `sql` as quoted literals. Values are
/// inserted in a single pass, so a `$N` inside a value is never rescanned.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    scan_placeholders(sql, |n, range| {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            return;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    });
    result.push_str(&sql[copied..]);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(engine);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(Rejection::SlotFull { .. }) => "53400",
        EngineError::Rejected(Rejection::DuplicateBooking) => "23505",
        other => match other.class() {
            ErrorClass::NotFound => "P0002",
            ErrorClass::Conflict => "23505",
            ErrorClass::Validation => "22023",
            ErrorClass::Internal => "XX000",
        },
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_invalid_input() { "22023" } else { "42601" };
    user_error(code, e.to_string())
}

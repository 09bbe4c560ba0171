use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error};
use ulid::Ulid;

use crate::access::{AccessError, Principal};
use crate::auth::PeerlinkAuthSource;
use crate::engine::{Category, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS, REJECTIONS_TOTAL};
use crate::sql::{self, Command};

pub struct PeerlinkHandler {
    engine: Arc<Engine>,
    query_parser: Arc<PeerlinkQueryParser>,
}

impl PeerlinkHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(PeerlinkQueryParser),
        }
    }

    /// The session's login name, which must be a user id.
    fn login_id<C: ClientInfo>(client: &C) -> PgWireResult<Ulid> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        Ulid::from_string(user).map_err(|_| access_err(AccessError::BadIdentity(user.to_string())))
    }

    fn principal(&self, login: Ulid) -> PgWireResult<Principal> {
        self.engine
            .user(&login)
            .map(|user| Principal::from(&user))
            .ok_or_else(|| access_err(AccessError::UnknownUser(login)))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let login = Self::login_id(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!(%login, command = label, "executing");

        let start = Instant::now();
        let result = self.execute_command(login, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, login: Ulid, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;

        // Registration is the only statement open to a login with no user row.
        let principal = || self.principal(login);
        match cmd {
            Command::RegisterUser { user } => {
                if user.id != login {
                    return Err(access_err(AccessError::ForeignIdentity(user.id)));
                }
                engine.register_user(user).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CreateSlot { slot, returning } => {
                let principal = principal()?;
                principal.require(Role::Tutor).map_err(access_err)?;
                let slot = engine
                    .create_slot(principal.id, slot)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    slot_rows(vec![slot])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::ListAvailable { filter } => {
                principal()?;
                let slots = engine.list_available(&filter).await;
                let schema = Arc::new(available_slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_slot(&mut encoder, &s.slot)?;
                        encoder.encode_field(&s.tutor_name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::ListMySlots => {
                let principal = principal()?;
                principal.require(Role::Tutor).map_err(access_err)?;
                let slots = engine.list_by_tutor(principal.id).await;
                let schema = Arc::new(tutor_slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_slot(&mut encoder, &s.slot)?;
                        encoder.encode_field(&s.student_names)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::UpdateSlot {
                id,
                patch,
                returning,
            } => {
                let principal = principal()?;
                principal.require(Role::Tutor).map_err(access_err)?;
                let slot = engine
                    .update_slot(id, principal.id, patch)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    slot_rows(vec![slot])
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteSlot { id } => {
                let principal = principal()?;
                principal.require(Role::Tutor).map_err(access_err)?;
                engine
                    .delete_slot(id, principal.id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Book { slot_id, returning } => {
                let principal = principal()?;
                principal.require(Role::Student).map_err(access_err)?;
                let booking = engine
                    .book(principal.id, slot_id)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(booking_schema());
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encode_booking(&mut encoder, &booking)?;
                    let rows = vec![Ok(encoder.take_row())];
                    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::ListMyBookings => {
                let principal = principal()?;
                principal.require(Role::Student).map_err(access_err)?;
                let bookings = engine.list_my_bookings(principal.id).await;
                let schema = Arc::new(booking_detail_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_booking(&mut encoder, &d.booking)?;
                        encoder.encode_field(&d.subject)?;
                        encoder.encode_field(&d.description)?;
                        encoder.encode_field(&d.start_time)?;
                        encoder.encode_field(&d.end_time)?;
                        encoder.encode_field(&d.tutor_name)?;
                        encoder.encode_field(&d.tutor_email)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::CancelBooking { id } => {
                let principal = principal()?;
                engine.cancel(principal.id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tutor_id"),
        text("subject"),
        text("description"),
        int8("start_time"),
        int8("end_time"),
        int8("capacity"),
        int8("booked_count"),
        text("status"),
    ]
}

fn available_slot_schema() -> Vec<FieldInfo> {
    let mut fields = slot_schema();
    fields.push(text("tutor_name"));
    fields
}

fn tutor_slot_schema() -> Vec<FieldInfo> {
    let mut fields = slot_schema();
    fields.push(text("student_names"));
    fields
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("slot_id"),
        text("student_id"),
        text("status"),
        int8("created_at"),
        int8("cancelled_at"),
    ]
}

fn booking_detail_schema() -> Vec<FieldInfo> {
    let mut fields = booking_schema();
    fields.extend([
        text("subject"),
        text("description"),
        int8("start_time"),
        int8("end_time"),
        text("tutor_name"),
        text("tutor_email"),
    ]);
    fields
}

/// Result columns for a statement, judged from its text alone so that
/// unbound `$n` placeholders don't matter.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("AVAILABLE_SLOTS") {
        available_slot_schema()
    } else if upper.contains("MY_SLOTS") {
        tutor_slot_schema()
    } else if upper.contains("MY_BOOKINGS") {
        booking_detail_schema()
    } else if upper.contains("RETURNING") && upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("RETURNING") && upper.contains("SLOTS") {
        slot_schema()
    } else {
        vec![]
    }
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.tutor_id.to_string())?;
    encoder.encode_field(&slot.subject)?;
    encoder.encode_field(&slot.description)?;
    encoder.encode_field(&slot.start_time)?;
    encoder.encode_field(&slot.end_time)?;
    encoder.encode_field(&i64::from(slot.capacity))?;
    encoder.encode_field(&i64::from(slot.booked_count))?;
    encoder.encode_field(&slot.status.as_str().to_string())?;
    Ok(())
}

fn encode_booking(encoder: &mut DataRowEncoder, booking: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.slot_id.to_string())?;
    encoder.encode_field(&booking.student_id.to_string())?;
    encoder.encode_field(&booking.status.as_str().to_string())?;
    encoder.encode_field(&booking.created_at)?;
    encoder.encode_field(&booking.cancelled_at)?;
    Ok(())
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_slot(&mut encoder, slot)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for PeerlinkHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PeerlinkQueryParser;

#[async_trait]
impl QueryParser for PeerlinkQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for PeerlinkHandler {
    type Statement = String;
    type QueryParser = PeerlinkQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
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
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Walks from the highest index down so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PeerlinkFactory {
    handler: Arc<PeerlinkHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PeerlinkAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl PeerlinkFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = PeerlinkAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PeerlinkHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PeerlinkFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(PeerlinkFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(category: Category) -> &'static str {
    match category {
        Category::Validation => "22023",
        Category::Conflict => "23P01",
        Category::Authorization => "42501",
        Category::Policy => "P0001",
        Category::NotFound => "02000",
        Category::Internal => "XX000",
    }
}

/// SQLSTATE and client-facing message for an engine rejection.
fn engine_error_info(e: &EngineError) -> (&'static str, String) {
    let category = e.category();
    let message = if category == Category::Internal {
        "internal error".to_string()
    } else {
        e.to_string()
    };
    (sqlstate(category), message)
}

fn engine_err(e: EngineError) -> PgWireError {
    metrics::counter!(REJECTIONS_TOTAL, "code" => e.code()).increment(1);
    if e.category() == Category::Internal {
        error!("internal error: {e}");
    }
    let (code, message) = engine_error_info(&e);
    user_error(code, message)
}

fn access_err(e: AccessError) -> PgWireError {
    let code = match e {
        AccessError::BadIdentity(_) | AccessError::UnknownUser(_) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            "28000"
        }
        AccessError::RoleRequired(_) | AccessError::ForeignIdentity(_) => "42501",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[FieldInfo]) -> Vec<String> {
        fields.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_takes_highest() {
        assert_eq!(count_params("SELECT * FROM available_slots"), 0);
        assert_eq!(
            count_params("INSERT INTO slots (subject, start_time, end_time) VALUES ($1, $3, $2)"),
            3
        );
        assert_eq!(count_params("DELETE FROM bookings WHERE id = $12"), 12);
    }

    #[test]
    fn statement_schema_by_target() {
        assert_eq!(
            names(&statement_schema("select * from available_slots where date = $1")).last().map(String::as_str),
            Some("tutor_name")
        );
        assert_eq!(
            names(&statement_schema("SELECT * FROM my_slots")).last().map(String::as_str),
            Some("student_names")
        );
        assert_eq!(
            names(&statement_schema("SELECT * FROM my_bookings")).len(),
            12
        );
        assert_eq!(
            names(&statement_schema("INSERT INTO bookings (slot_id) VALUES ($1) RETURNING *")),
            vec!["id", "slot_id", "student_id", "status", "created_at", "cancelled_at"]
        );
        assert_eq!(
            statement_schema("UPDATE slots SET capacity = 3 WHERE id = $1 RETURNING *").len(),
            9
        );
        assert!(statement_schema("DELETE FROM slots WHERE id = $1").is_empty());
    }

    #[test]
    fn categories_map_to_sqlstates() {
        assert_eq!(sqlstate(Category::Validation), "22023");
        assert_eq!(sqlstate(Category::Conflict), "23P01");
        assert_eq!(sqlstate(Category::Authorization), "42501");
        assert_eq!(sqlstate(Category::Policy), "P0001");
        assert_eq!(sqlstate(Category::NotFound), "02000");
        assert_eq!(sqlstate(Category::Internal), "XX000");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let (code, message) =
            engine_error_info(&EngineError::Storage("disk on fire at /var/lib".into()));
        assert_eq!(code, "XX000");
        assert_eq!(message, "internal error");

        let (code, message) = engine_error_info(&EngineError::AlreadyBooked(Ulid::nil()));
        assert_eq!(code, "23P01");
        assert!(message.contains("already booked"));
    }
}

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::ChairbookAuthSource;
use crate::error::ScheduleError;
use crate::model::*;
use crate::normalize::{format_date, parse_date};
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::service::SchedulingService;
use crate::sql::{self, Command, SqlError};

pub struct ChairbookHandler {
    service: Arc<SchedulingService>,
    query_parser: Arc<ChairbookQueryParser>,
}

impl ChairbookHandler {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation(req) => {
                let id = self
                    .service
                    .request_reservation(req)
                    .await
                    .map_err(schedule_err)?;
                let schema = Arc::new(id_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id_value(id))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::CancelReservation { id, client_id } => {
                self.service
                    .cancel_reservation(id, &client_id)
                    .await
                    .map_err(schedule_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectOccupied { date } => {
                let slots: Vec<(String, String)> = match date {
                    Some(date) => {
                        let day = parse_date(&date).map_err(schedule_err)?;
                        let times = self
                            .service
                            .occupied_times_on(&date)
                            .await
                            .map_err(schedule_err)?;
                        times.into_iter().map(|t| (format_date(day), t)).collect()
                    }
                    None => self
                        .service
                        .occupied_slots()
                        .await
                        .into_iter()
                        .flat_map(|(day, times)| {
                            times.into_iter().map(move |t| (format_date(day), t.to_string()))
                        })
                        .collect(),
                };
                slot_rows(slots)
            }
            Command::SelectAvailable { date } => {
                let day = parse_date(&date).map_err(schedule_err)?;
                let times = self
                    .service
                    .available_times_on(&date)
                    .await
                    .map_err(schedule_err)?;
                slot_rows(times.into_iter().map(|t| (format_date(day), t)).collect())
            }
            Command::SelectClientReservations { client_id } => {
                let list = self.service.reservations_for_client(&client_id).await;
                reservation_rows(&list)
            }
            Command::SelectReservation { id, client_id } => {
                let r = self
                    .service
                    .reservation(id, &client_id)
                    .await
                    .map_err(schedule_err)?;
                reservation_rows(std::slice::from_ref(&r))
            }
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn id_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new("id".into(), None, None, Type::INT8, FieldFormat::Text)]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), text_field("slot_time")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("client_id"),
        text_field("date"),
        text_field("slot_time"),
        text_field("services"),
        text_field("total"),
        text_field("phone"),
        text_field("contact_email"),
        text_field("status"),
        text_field("created_at"),
        text_field("cancelled_at"),
    ]
}

/// Result columns a statement will produce, for Describe messages.
fn schema_for(statement: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(statement) {
        Ok(Command::InsertReservation(_)) => id_schema(),
        Ok(Command::SelectOccupied { .. } | Command::SelectAvailable { .. }) => slot_schema(),
        Ok(Command::SelectClientReservations { .. } | Command::SelectReservation { .. }) => {
            reservation_schema()
        }
        _ => vec![],
    }
}

fn id_value(id: ReservationId) -> i64 {
    i64::try_from(id.0).unwrap_or(i64::MAX)
}

fn slot_rows(slots: Vec<(String, String)>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|(date, time)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&date)?;
            encoder.encode_field(&time)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(list: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = list
        .iter()
        .map(|r| {
            let services = serde_json::to_string(&r.services)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&id_value(r.id))?;
            encoder.encode_field(&r.client_id.0)?;
            encoder.encode_field(&format_date(r.date()))?;
            encoder.encode_field(&r.slot_time().to_string())?;
            encoder.encode_field(&services)?;
            encoder.encode_field(&r.total.to_string())?;
            encoder.encode_field(&r.phone)?;
            encoder.encode_field(&r.contact_email)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&format_timestamp(r.created_at))?;
            encoder.encode_field(&r.cancelled_at.map(format_timestamp))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn format_timestamp(t: chrono::NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
        Ok(schema_for(&placeholders_as_literals(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

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
        self.run(&sql).await
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
        let fields = schema_for(&placeholders_as_literals(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        Ok(DescribePortalResponse::new(schema_for(&substitute_params(target))))
    }
}

/// Walk `sql` once, left to right, offering every `$N` outside quoted text
/// to `replace`. `None` keeps the placeholder as written. Replacement text
/// is never scanned again.
fn rewrite_placeholders(sql: &str, mut replace: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                // '' and "" inside a quoted run read as close-then-reopen,
                // which leaves the scanner in the same place.
                out.push(c);
                for (_, inner) in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '$' => {
                let digits_start = i + 1;
                let mut digits_end = digits_start;
                while let Some(&(j, d)) = chars.peek()
                    && d.is_ascii_digit()
                {
                    digits_end = j + 1;
                    chars.next();
                }
                let text = &sql[i..digits_end];
                match sql[digits_start..digits_end].parse::<usize>().ok().and_then(&mut replace) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(text),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Statement text with every `$N` replaced by an empty literal, so an
/// unbound statement still parses for Describe.
fn placeholders_as_literals(sql: &str) -> String {
    rewrite_placeholders(sql, |_| Some("''".to_string()))
}

/// Inline text-format parameters as quoted literals. Placeholders without a
/// bound value are left alone and fail to parse later.
fn bind_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    rewrite_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(service: Arc<SchedulingService>, password: String) -> Self {
        let auth_source = ChairbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChairbookHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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
    service: Arc<SchedulingService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ChairbookFactory::new(service, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for each scheduling outcome.
pub fn sqlstate(e: &ScheduleError) -> &'static str {
    match e {
        ScheduleError::MalformedRequest(_) => "22023",
        ScheduleError::PastTime { .. }
        | ScheduleError::CooldownActive { .. }
        | ScheduleError::CancellationTooLate { .. }
        | ScheduleError::SlotNotOffered { .. } => "P0001",
        ScheduleError::SlotConflict { .. } => "23505",
        ScheduleError::NotOwner(_) => "42501",
        ScheduleError::NotFound(_) => "P0002",
        ScheduleError::LimitExceeded(_) => "54000",
        ScheduleError::TransientStorageFailure(_) => "58030",
    }
}

fn schedule_err(e: ScheduleError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn sqlstates_are_distinct_per_family() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert_eq!(
            sqlstate(&ScheduleError::SlotConflict {
                date: day,
                slot_time: SlotTime::from_hm(14, 0).unwrap(),
            }),
            "23505"
        );
        assert_eq!(
            sqlstate(&ScheduleError::CooldownActive { earliest_allowed: day }),
            "P0001"
        );
        assert_eq!(sqlstate(&ScheduleError::NotOwner(ReservationId(1))), "42501");
        assert_eq!(sqlstate(&ScheduleError::malformed("x")), "22023");
        assert_eq!(
            sqlstate(&ScheduleError::TransientStorageFailure("disk".into())),
            "58030"
        );
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM occupied"), 0);
        assert_eq!(
            count_params("DELETE FROM reservations WHERE id = $1 AND client_id = $2"),
            2
        );
        assert_eq!(count_params("VALUES ($3, $1, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM occupied WHERE date = '$9'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations VALUES ($1, $2, $3)";
        let params = [Some("ana".as_bytes()), Some("$1".as_bytes()), Some("o'neil".as_bytes())];
        assert_eq!(
            bind_text_params(sql, &params),
            "INSERT INTO reservations VALUES ('ana', '$1', 'o''neil')"
        );
    }

    #[test]
    fn placeholders_inside_literals_are_kept() {
        let sql = "SELECT * FROM reservations WHERE client_id = $1 AND phone = 'it''s $1'";
        assert_eq!(
            bind_text_params(sql, &[Some("ana".as_bytes())]),
            "SELECT * FROM reservations WHERE client_id = 'ana' AND phone = 'it''s $1'"
        );
        let unbound: [Option<&[u8]>; 2] = [None, None];
        assert_eq!(
            bind_text_params("VALUES ($2, $3)", &unbound),
            "VALUES (NULL, $3)"
        );
    }

    #[test]
    fn describe_schema_follows_statement() {
        let insert = "INSERT INTO reservations VALUES ($1, $2, $3, $4, $5, $6, $7)";
        let fields = schema_for(&placeholders_as_literals(insert));
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name(), "id");

        let select = "SELECT * FROM reservations WHERE client_id = $1";
        assert_eq!(schema_for(&placeholders_as_literals(select)).len(), 11);
        assert!(schema_for("DELETE FROM reservations WHERE id = 1 AND client_id = 'a'").is_empty());
    }
}

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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::GymAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind, require_admin};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AppointmentFilter, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

pub struct GymHandler {
    tenant_manager: Arc<TenantManager>,
    admin_user: String,
    query_parser: Arc<GymQueryParser>,
}

impl GymHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_user: String) -> Self {
        Self {
            tenant_manager,
            admin_user,
            query_parser: Arc::new(GymQueryParser),
        }
    }

    /// One engine per gym, chosen by the connection's database name.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("gym error: {e}"),
            )))
        })
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Caller> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        engine.resolve_caller(&user, &self.admin_user).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejected login {user:?}: {e}");
            engine_err(e)
        })
    }

    /// Parse and run every statement in `query`, stopping at the first failure.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client, &engine)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run_command(&engine, caller, cmd).await?);
        }
        Ok(responses)
    }

    async fn run_command(
        &self,
        engine: &Engine,
        caller: Caller,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: Caller,
        cmd: Command,
    ) -> Result<Response, EngineError> {
        match cmd {
            Command::PutTrainer {
                id,
                name,
                working_hours,
            } => {
                require_admin(caller, "only administrators can edit trainers")?;
                let working_hours = match working_hours {
                    Some((start, end)) => Some(WorkingHours::new(start, end).ok_or(
                        EngineError::InvalidRequest("working hours must start before they end"),
                    )?),
                    None => None,
                };
                engine.put_trainer(id, name, working_hours).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::PutService {
                id,
                name,
                duration_minutes,
                fee,
            } => {
                require_admin(caller, "only administrators can edit services")?;
                engine.put_service(id, name, duration_minutes, fee).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::PutMember {
                id,
                name,
                principal,
            } => {
                require_admin(caller, "only administrators can edit members")?;
                engine.put_member(id, name, principal).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAppointment {
                member_id,
                trainer_id,
                service_id,
                start,
            } => {
                let member_id = match (member_id, caller) {
                    (Some(id), _) => id,
                    (None, Caller::Member(me)) => me,
                    (None, Caller::Admin) => {
                        return Err(EngineError::InvalidRequest("member_id is required"));
                    }
                };
                let appointment = engine
                    .book_as(caller, member_id, trainer_id, service_id, start)
                    .await?;
                Ok(appointments_response(vec![appointment]))
            }
            Command::SetStatus { id, status } => {
                engine.set_status_as(caller, id, status).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelAppointment { id } => {
                engine.cancel_as(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointments(filter) => {
                let appointments = select_appointments(engine, caller, &filter).await?;
                Ok(appointments_response(appointments))
            }
            Command::SelectAvailability {
                trainer_id,
                instant,
            } => {
                let available = engine.is_trainer_available(trainer_id, instant).await?;
                let schema = Arc::new(availability_schema());
                let row = (|| -> PgWireResult<DataRow> {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&(trainer_id as i64))?;
                    encoder.encode_field(&format_instant(instant))?;
                    encoder.encode_field(&available)?;
                    Ok(encoder.take_row())
                })();
                let rows = vec![row];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectStats => {
                require_admin(caller, "only administrators can view statistics")?;
                let counts = engine.status_counts().await;
                let schema = Arc::new(stats_schema());
                let row = (|| -> PgWireResult<DataRow> {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    for n in [
                        counts.total,
                        counts.pending,
                        counts.approved,
                        counts.rejected,
                        counts.cancelled,
                    ] {
                        encoder.encode_field(&(n as i64))?;
                    }
                    Ok(encoder.take_row())
                })();
                let rows = vec![row];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectTrainers => Ok(trainers_response(engine.list_trainers().await)),
            Command::SelectAvailableTrainers { instant } => {
                Ok(trainers_response(engine.available_trainers(instant).await))
            }
            Command::SelectServices => {
                let services = engine.list_services();
                let schema = Arc::new(service_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(s.id as i64))?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&i64::from(s.duration_minutes))?;
                        encoder.encode_field(&s.fee.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectMembers => {
                require_admin(caller, "only administrators can list members")?;
                let members = engine.list_members();
                let schema = Arc::new(member_schema());
                let rows: Vec<PgWireResult<_>> = members
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(m.id as i64))?;
                        encoder.encode_field(&m.name)?;
                        encoder.encode_field(&m.principal)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

/// Pick the narrowest engine query for the filter, then apply the rest of it row by row.
/// Members may only reach their own appointments; every wider listing is admin-only.
async fn select_appointments(
    engine: &Engine,
    caller: Caller,
    filter: &AppointmentFilter,
) -> Result<Vec<Appointment>, EngineError> {
    let candidates = if let Some(id) = filter.id {
        match engine.appointment_as(caller, id).await {
            Ok(a) => vec![a],
            Err(EngineError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        }
    } else if let Some(member_id) = filter.member_id {
        engine
            .member_appointments_as(caller, member_id, filter.from, filter.until)
            .await?
    } else if let Caller::Member(me) = caller {
        engine
            .member_appointments_as(caller, me, filter.from, filter.until)
            .await?
    } else if let Some(trainer_id) = filter.trainer_id {
        engine
            .list_by_trainer(trainer_id, filter.from, filter.until)
            .await?
    } else if let Some(status) = filter.status {
        engine.list_by_status(status).await
    } else if filter.has_date_range() {
        engine
            .list_by_date_range(
                filter.start_date_from.unwrap_or(chrono::NaiveDate::MIN),
                filter.start_date_until.unwrap_or(chrono::NaiveDate::MAX),
            )
            .await?
    } else {
        engine.list_all().await
    };
    Ok(candidates.into_iter().filter(|a| filter.matches(a)).collect())
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        int_field("member_id"),
        int_field("trainer_id"),
        int_field("service_id"),
        text_field("start"),
        text_field("end"),
        text_field("fee"),
        text_field("status"),
        text_field("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        int_field("trainer_id"),
        text_field("instant"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        int_field("total"),
        int_field("pending"),
        int_field("approved"),
        int_field("rejected"),
        int_field("cancelled"),
    ]
}

fn trainer_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        text_field("name"),
        text_field("work_start"),
        text_field("work_end"),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        text_field("name"),
        int_field("duration_minutes"),
        text_field("fee"),
    ]
}

fn member_schema() -> Vec<FieldInfo> {
    vec![int_field("id"), text_field("name"), text_field("principal")]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Appointments => appointment_schema(),
        ResultShape::Availability => availability_schema(),
        ResultShape::Stats => stats_schema(),
        ResultShape::Trainers => trainer_schema(),
        ResultShape::Services => service_schema(),
        ResultShape::Members => member_schema(),
        ResultShape::None => vec![],
    }
}

fn trainers_response(trainers: Vec<TrainerInfo>) -> Response {
    let schema = Arc::new(trainer_schema());
    let rows: Vec<PgWireResult<_>> = trainers
        .into_iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(t.id as i64))?;
            encoder.encode_field(&t.name)?;
            let hours = t.working_hours;
            encoder.encode_field(&hours.map(|w| w.start.format("%H:%M").to_string()))?;
            encoder.encode_field(&hours.map(|w| w.end.format("%H:%M").to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn appointments_response(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(a.id as i64))?;
            encoder.encode_field(&(a.member_id as i64))?;
            encoder.encode_field(&(a.trainer_id as i64))?;
            encoder.encode_field(&(a.service_id as i64))?;
            encoder.encode_field(&format_instant(a.span.start))?;
            encoder.encode_field(&format_instant(a.span.end))?;
            encoder.encode_field(&a.fee.to_string())?;
            encoder.encode_field(&a.status.as_str().to_string())?;
            encoder.encode_field(&format_instant(a.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for GymHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GymQueryParser;

#[async_trait]
impl QueryParser for GymQueryParser {
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
        Ok(schema_for(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GymHandler {
    type Statement = String;
    type QueryParser = GymQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client, &engine)?;
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run_command(&engine, caller, cmd).await
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
            schema_for(sql::result_shape(&target.statement)),
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
        Ok(DescribePortalResponse::new(schema_for(sql::result_shape(
            &target.statement.statement,
        ))))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement, so text inside a bound value is
/// never read as a placeholder. Unbound `$N` is left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GymFactory {
    handler: Arc<GymHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<GymAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl GymFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, admin_user: String) -> Self {
        let auth_source = GymAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GymHandler::new(tenant_manager, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GymFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(GymFactory::new(tenant_manager, password, admin_user));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::OutOfHours => "22008",
        ErrorKind::NotFound => "02000",
        ErrorKind::Forbidden => "42501",
        ErrorKind::StorageFailure => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    if kind == ErrorKind::StorageFailure {
        tracing::error!("storage failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(kind).into(),
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

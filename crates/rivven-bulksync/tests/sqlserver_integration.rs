//! SQL Server end-to-end tests
//!
//! Run with: cargo test -p rivven-bulksync --test sqlserver_integration -- --ignored --nocapture
//!
//! Requirements: Docker must be running for testcontainers.

#![cfg(feature = "sqlserver")]

use std::time::Duration;

use anyhow::Result;
use rivven_bulksync::connection::ConnectionConfig;
use rivven_bulksync::error::ErrorCategory;
use rivven_bulksync::executor::{SyncEngine, TableSync};
use rivven_bulksync::request::SyncRequest;
use rivven_bulksync::types::{Row, Value};
use rust_decimal::Decimal;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::mssql_server::MssqlServer;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

const SA_PASSWORD: &str = "yourStrong(!)Password"; // MssqlServer default
const TEST_DB: &str = "testdb";
const MSSQL_PORT: u16 = 1433;

type TdsClient = Client<Compat<TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rivven_bulksync=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

struct TestSqlServer {
    _container: ContainerAsync<MssqlServer>,
    host: String,
    port: u16,
}

impl TestSqlServer {
    async fn start() -> Result<Self> {
        init_tracing();

        let container = MssqlServer::default()
            .with_accept_eula()
            .with_tag("2019-latest")
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(MSSQL_PORT).await?;

        let server = Self {
            _container: container,
            host,
            port,
        };
        server.create_database().await?;
        Ok(server)
    }

    async fn create_database(&self) -> Result<()> {
        for _ in 0..60 {
            if let Ok(mut client) = self.connect("master").await {
                client
                    .simple_query(format!(
                        "IF DB_ID(N'{TEST_DB}') IS NULL CREATE DATABASE {TEST_DB}"
                    ))
                    .await?
                    .into_results()
                    .await?;
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("SQL Server did not become ready in time")
    }

    async fn connect(&self, database: &str) -> Result<TdsClient> {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(database);
        config.authentication(AuthMethod::sql_server("sa", SA_PASSWORD));
        config.encryption(EncryptionLevel::NotSupported);
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Ok(Client::connect(config, tcp.compat_write()).await?)
    }

    fn connection_string(&self) -> String {
        format!(
            "server=tcp:{},{};database={};user id=sa;password={};\
             TrustServerCertificate=true;encrypt=DANGER_PLAINTEXT",
            self.host, self.port, TEST_DB, SA_PASSWORD
        )
    }

    fn engine(&self) -> SyncEngine {
        SyncEngine::sqlserver(ConnectionConfig::new(self.connection_string()))
    }
}

async fn batch(client: &mut TdsClient, sql: &str) -> Result<()> {
    client.simple_query(sql).await?.into_results().await?;
    Ok(())
}

async fn ints(client: &mut TdsClient, sql: &str) -> Result<Vec<i32>> {
    let rows = client.query(sql, &[]).await?.into_first_result().await?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get::<i32, _>(0))
        .collect())
}

async fn setup_customer(client: &mut TdsClient) -> Result<()> {
    batch(
        client,
        r#"
        IF SCHEMA_ID(N'poc') IS NULL EXEC(N'CREATE SCHEMA poc');
        IF OBJECT_ID(N'poc.customer', N'U') IS NOT NULL DROP TABLE poc.customer;
        CREATE TABLE poc.customer (
            ID INT PRIMARY KEY,
            name NVARCHAR(100) NOT NULL,
            source NVARCHAR(100),
            balance DECIMAL(12, 2),
            created_at DATETIME2
        );
        "#,
    )
    .await
}

fn customer(id: i32, name: &str) -> Row {
    Row::default()
        .with("ID", id)
        .with("name", name)
        .with("source", "Sync POC")
}

fn insert(rows: impl IntoIterator<Item = Row>) -> SyncRequest {
    SyncRequest::insert("customer")
        .with_schema("poc")
        .key_column("ID")
        .column("name")
        .column("source")
        .rows(rows)
}

fn delete(ids: impl IntoIterator<Item = i32>) -> SyncRequest {
    SyncRequest::delete("customer")
        .with_schema("poc")
        .key_column("ID")
        .rows(ids.into_iter().map(|id| Row::default().with("ID", id)))
}

async fn customer_ids(client: &mut TdsClient) -> Result<Vec<i32>> {
    ints(client, "SELECT ID FROM poc.customer ORDER BY ID").await
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_customer_scenario() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    setup_customer(&mut client).await?;
    let sync = server.engine();

    let inserted = sync
        .apply(&insert([customer(1, "John Doe"), customer(2, "Jane Smith")]))
        .await?;
    assert_eq!(inserted, 2);
    assert_eq!(customer_ids(&mut client).await?, vec![1, 2]);

    let deleted = sync.apply(&delete([1])).await?;
    assert_eq!(deleted, 1);
    assert_eq!(customer_ids(&mut client).await?, vec![2]);

    // deleting again matches nothing
    assert_eq!(sync.apply(&delete([1])).await?, 0);

    // staging tables are dropped before commit
    let staged = ints(
        &mut client,
        "SELECT COUNT(*) FROM tempdb.sys.tables WHERE name LIKE N'#customer[_][_]%'",
    )
    .await?;
    assert_eq!(staged, vec![0]);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_update_overwrites_matched_rows() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    setup_customer(&mut client).await?;
    let sync = server.engine();

    sync.apply(&insert((1..=3).map(|i| customer(i, "before"))))
        .await?;

    let update = SyncRequest::update("customer")
        .with_schema("poc")
        .key_column("ID")
        .column("name")
        .column("balance")
        .column("created_at")
        .rows([
            Row::default()
                .with("ID", 1)
                .with("name", "after")
                .with("balance", Decimal::new(12_345, 2))
                .with("created_at", Value::Null),
            Row::default()
                .with("ID", 3)
                .with("name", "after")
                .with("balance", Value::Null)
                .with("created_at", Value::Null),
            // no such customer
            Row::default()
                .with("ID", 99)
                .with("name", "ghost")
                .with("balance", Value::Null)
                .with("created_at", Value::Null),
        ]);
    assert_eq!(sync.apply(&update).await?, 2);

    let rows = client
        .query("SELECT ID, name, source, balance FROM poc.customer ORDER BY ID", &[])
        .await?
        .into_first_result()
        .await?;
    let names: Vec<(i32, String)> = rows
        .iter()
        .map(|r| {
            (
                r.get::<i32, _>(0).unwrap_or_default(),
                r.get::<&str, _>(1).unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        names,
        vec![
            (1, "after".to_string()),
            (2, "before".to_string()),
            (3, "after".to_string())
        ]
    );
    // columns outside the request are untouched
    assert_eq!(rows[0].get::<&str, _>(2), Some("Sync POC"));
    assert_eq!(
        rows[0].get::<Decimal, _>(3),
        Some(Decimal::new(12_345, 2))
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_identity_keyed_target() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    batch(
        &mut client,
        r#"
        IF OBJECT_ID(N'dbo.ticket', N'U') IS NOT NULL DROP TABLE dbo.ticket;
        CREATE TABLE dbo.ticket (
            TicketId INT IDENTITY(1,1) PRIMARY KEY,
            Title NVARCHAR(200) NOT NULL
        );
        INSERT INTO dbo.ticket (Title) VALUES (N'one'), (N'two'), (N'three');
        "#,
    )
    .await?;
    let sync = server.engine();

    let ticket = |id: i32, title: &str| Row::default().with("TicketId", id).with("Title", title);

    // the staging copy of the key must accept explicit values
    let update = SyncRequest::update("ticket")
        .with_schema("dbo")
        .key_column("TicketId")
        .column("Title")
        .rows([ticket(1, "first"), ticket(3, "third")]);
    assert_eq!(sync.apply(&update).await?, 2);

    let delete = SyncRequest::delete("ticket")
        .with_schema("dbo")
        .key_column("TicketId")
        .rows([Row::default().with("TicketId", 2)]);
    assert_eq!(sync.apply(&delete).await?, 1);

    let titles = client
        .query("SELECT TicketId, Title FROM dbo.ticket ORDER BY TicketId", &[])
        .await?
        .into_first_result()
        .await?;
    let titles: Vec<(i32, String)> = titles
        .iter()
        .map(|r| {
            (
                r.get::<i32, _>(0).unwrap_or_default(),
                r.get::<&str, _>(1).unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        titles,
        vec![(1, "first".to_string()), (3, "third".to_string())]
    );

    // explicit identity values are refused by the server; nothing is applied
    let insert = SyncRequest::insert("ticket")
        .with_schema("dbo")
        .key_column("TicketId")
        .column("Title")
        .rows([ticket(10, "ten")]);
    let err = sync.apply(&insert).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Merge);
    assert!(err.to_string().contains("IDENTITY_INSERT"), "{}", err);
    assert_eq!(
        ints(&mut client, "SELECT TicketId FROM dbo.ticket ORDER BY TicketId").await?,
        vec![1, 3]
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failed_load_leaves_target_unchanged() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    setup_customer(&mut client).await?;
    let sync = server.engine();

    sync.apply(&insert([customer(1, "John Doe")])).await?;

    // the last row cannot be stored in an INT column
    let mut rows: Vec<Row> = (10..20).map(|i| customer(i, "batch")).collect();
    rows.push(
        Row::default()
            .with("ID", "not a number")
            .with("name", "bad")
            .with("source", "Sync POC"),
    );

    let err = sync.apply(&insert(rows)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Staging);
    assert_eq!(customer_ids(&mut client).await?, vec![1]);

    // the engine is still usable afterwards
    assert_eq!(sync.apply(&insert([customer(2, "Jane Smith")])).await?, 1);
    assert_eq!(customer_ids(&mut client).await?, vec![1, 2]);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_duplicate_key_insert_rolls_back() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    setup_customer(&mut client).await?;
    let sync = server.engine();

    sync.apply(&insert([customer(1, "John Doe")])).await?;

    let err = sync
        .apply(&insert([customer(2, "Jane Smith"), customer(1, "again")]))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Merge);
    assert!(err.to_string().contains("PRIMARY KEY"), "{}", err);
    assert_eq!(customer_ids(&mut client).await?, vec![1]);

    let stats = sync.stats();
    assert_eq!(stats.requests_applied, 1);
    assert_eq!(stats.requests_failed, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_large_batch() -> Result<()> {
    let server = TestSqlServer::start().await?;
    let mut client = server.connect(TEST_DB).await?;
    setup_customer(&mut client).await?;
    let sync = server.engine();

    let n = 10_000;
    let affected = sync
        .apply(&insert((1..=n).map(|i| customer(i, &format!("customer {}", i)))))
        .await?;
    assert_eq!(affected, n as u64);

    let deleted = sync.apply(&delete((1..=n).filter(|i| i % 2 == 0))).await?;
    assert_eq!(deleted, (n / 2) as u64);

    let count = ints(&mut client, "SELECT COUNT(*) FROM poc.customer").await?;
    assert_eq!(count, vec![n - n / 2]);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_health_check() -> Result<()> {
    let server = TestSqlServer::start().await?;
    server.engine().health_check().await?;
    Ok(())
}

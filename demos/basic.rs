use hrana_client::{Client, Stmt, Stream, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // HRANA_URL picks the transport: ws(s):// or http(s):// / libsql://
    let client = Client::from_env()?;
    let stream = client.open_stream()?;

    stream
        .execute(Stmt::execute(
            "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            (),
        ))
        .await?;

    stream
        .execute(Stmt::execute(
            "INSERT INTO users (name) VALUES (?)",
            [Value::text("Kit")],
        ))
        .await?;

    let result = stream
        .execute(
            Stmt::new("SELECT id, name FROM users WHERE name = :name")
                .bind_named("name", "Kit"),
        )
        .await?;

    for row in result.into_rows() {
        println!("id={:?} name={:?}", row.get_i64("id"), row.get_text("name"));
    }

    println!("protocol version {}", stream.get_version().await?);
    stream.close_gracefully().await?;
    client.close();
    Ok(())
}

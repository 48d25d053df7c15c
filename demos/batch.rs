use hrana_client::{BatchCond, Client, StepOutput, StepResult, Stmt, Stream, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::from_env()?;
    let stream = client.open_stream()?;

    let mut batch = stream.batch();
    let begin = batch.step().run("BEGIN")?;
    let create = batch
        .step()
        .condition(BatchCond::ok(begin))
        .run("CREATE TABLE IF NOT EXISTS batch_users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
    let insert = batch
        .step()
        .condition(BatchCond::ok(create))
        .run(Stmt::new("INSERT INTO batch_users (name) VALUES (?)").bind("Alice"))?;
    let count = batch
        .step()
        .condition(BatchCond::ok(insert))
        .query_value("SELECT count(*) FROM batch_users")?;
    batch.step().condition(BatchCond::ok(count)).run("COMMIT")?;
    batch
        .step()
        .condition(BatchCond::not(BatchCond::ok(count)))
        .run("ROLLBACK")?;

    // Cursors stream rows step by step; they need protocol version 3.
    let results = if stream.get_version().await? >= 3 {
        batch.execute_with_cursor().await?
    } else {
        batch.execute().await?
    };

    for (index, result) in results.iter().enumerate() {
        match result {
            StepResult::Skipped => println!("step {index}: skipped"),
            StepResult::Error(err) => eprintln!("step {index}: {err}"),
            StepResult::Ok(StepOutput::Value(Some(Value::Integer(count)))) => {
                println!("step {index}: {count} user(s)")
            }
            StepResult::Ok(output) => println!("step {index}: {output:?}"),
        }
    }

    stream.close_gracefully().await?;
    Ok(())
}

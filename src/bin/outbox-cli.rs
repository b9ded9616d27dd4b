use std::env;

use chrono::{DateTime, Utc};
use outbox_relay::PgOutboxStore;
use sqlx::PgPool;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "stats" if args.len() == 3 => {
            let store = connect(&args[2]).await?;
            let (pending, age_seconds) = store.pending_stats().await?;
            println!("pending: {pending}");
            println!("oldest pending age: {age_seconds}s");
        }
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let store = connect(&args[3]).await?;
            let count = store.replay_since(ts).await?;
            println!("Replayed {count} records since {ts}");
        }
        "replay-range" if args.len() == 5 => {
            let from = Uuid::parse_str(&args[2])?;
            let to = Uuid::parse_str(&args[3])?;
            let store = connect(&args[4]).await?;
            let count = store.replay_range(from, to).await?;
            println!("Replayed {count} records between {from} and {to}");
        }
        _ => {
            usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn connect(db_url: &str) -> Result<PgOutboxStore, sqlx::Error> {
    let pool = PgPool::connect(db_url).await?;
    Ok(PgOutboxStore::new(pool))
}

fn usage() {
    eprintln!("Usage:");
    eprintln!("  outbox-cli stats <DATABASE_URL>");
    eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
    eprintln!("  outbox-cli replay-range <from_uuid> <to_uuid> <DATABASE_URL>");
}

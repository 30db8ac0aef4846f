use std::env;
use std::io::IsTerminal;
use std::process;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use ledger_audit::{
    current_version, show_table, Db, FailurePolicy, LedgerAuditor, MigrationRunner,
};

/// Prompting only makes sense when an operator is actually at the other
/// end of stdin; piped/daemonized runs abort on migration failure.
fn failure_policy(non_interactive: bool, stdin_is_tty: bool) -> FailurePolicy {
    if non_interactive || !stdin_is_tty {
        FailurePolicy::AlwaysAbort
    } else {
        FailurePolicy::PromptOperator
    }
}

fn print_usage() {
    eprintln!("Usage: ledger-audit [OPTIONS] [DB_PATH]");
    eprintln!();
    eprintln!("Runs pending schema migrations, then verifies ledger integrity.");
    eprintln!();
    eprintln!("  DB_PATH               SQLite database (default: $LEDGER_DB or ledger.db)");
    eprintln!("  --non-interactive     never prompt; abort on any migration failure");
    eprintln!("  --show TABLE          dump a table and exit");
    eprintln!("  --migrate-only        skip the integrity checks");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut db_path: Option<String> = None;
    let mut show: Option<String> = None;
    let mut migrate_only = false;
    let mut non_interactive = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--non-interactive" => non_interactive = true,
            "--migrate-only" => migrate_only = true,
            "--show" => {
                show = Some(args.next().ok_or_else(|| {
                    anyhow::anyhow!("--show requires a table name")
                })?);
            }
            other if other.starts_with('-') => {
                print_usage();
                anyhow::bail!("unknown option: {}", other);
            }
            other => db_path = Some(other.to_string()),
        }
    }

    let db_path = db_path
        .or_else(|| env::var("LEDGER_DB").ok())
        .unwrap_or_else(|| "ledger.db".to_string());

    let db = Db::open(&db_path)?;

    if let Some(table) = show {
        print!("{}", show_table(&db, &table)?);
        return Ok(());
    }

    println!("🗄️  Ledger Audit - {}", db_path);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let policy = failure_policy(non_interactive, std::io::stdin().is_terminal());

    println!("\n🔧 Running migrations...");
    let applied = MigrationRunner::new(policy).run(&db)?;
    if applied == 0 {
        println!("✓ Schema up to date (version {})", current_version(&db)?);
    } else {
        println!(
            "✓ Applied {} migration(s), now at version {}",
            applied,
            current_version(&db)?
        );
    }

    if migrate_only {
        return Ok(());
    }

    println!("\n🔍 Verifying ledger integrity...");
    let outcome = LedgerAuditor::new(&db).verify_all()?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if outcome.is_clean() {
        println!("✅ All 7 checks passed");
        Ok(())
    } else {
        for violation in &outcome.violations {
            eprintln!("\n{}", violation);
        }
        eprintln!(
            "\n❌ {} check(s) failed - manual intervention required",
            outcome.violations.len()
        );
        process::exit(1);
    }
}

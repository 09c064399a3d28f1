use std::{collections::BTreeMap, path::PathBuf};

use cert_server::{
    auth::{CapabilityKeys, Role},
    certificate::{self, verify::VerificationQuery},
    chapter::QuizRef,
    config::{Config, Secrets},
    coupon::{self, BatchRequest, NewCoupon},
    db, progress, quiz,
    utils::init_log,
};
use clap::Parser;
use sqlx::SqlitePool;

const OPERATOR: &str = "cert-admin";

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "cert-server.toml")]
    config: PathBuf,
    /// Overrides the database path from the config file.
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Create the database and its tables.
    InitDb,
    AnswerKey {
        #[command(subcommand)]
        command: AnswerKeyCommand,
    },
    Coupon {
        #[command(subcommand)]
        command: CouponCommand,
    },
    /// Print a capability token for `user`.
    Capability {
        user: String,
        #[arg(long)]
        admin: bool,
        #[arg(long)]
        ttl_minutes: Option<i64>,
    },
    Certificate {
        #[command(subcommand)]
        command: CertificateCommand,
    },
    Progress {
        #[command(subcommand)]
        command: ProgressCommand,
    },
}

#[derive(Debug, clap::Subcommand)]
enum AnswerKeyCommand {
    /// Load `{ "questionId": "answer" }` from a JSON file for `quiz` (`CH-001` or `final-test`).
    Load { quiz: String, file: PathBuf },
}

#[derive(Debug, clap::Subcommand)]
enum CouponCommand {
    Create {
        code: String,
        #[arg(short = 'p', long, default_value = "100")]
        discount: u8,
        /// 0 means unlimited.
        #[arg(short, long, default_value = "1")]
        max_uses: u32,
        #[arg(short, long)]
        expires_in_days: Option<u32>,
    },
    Batch {
        count: u32,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(short = 'p', long)]
        discount: Option<u8>,
        #[arg(short, long)]
        max_uses: Option<u32>,
        #[arg(short, long)]
        expires_in_days: Option<u32>,
    },
    List,
    Usage { code: String },
}

#[derive(Debug, clap::Subcommand)]
enum CertificateCommand {
    Revoke {
        id: String,
    },
    Verify {
        id: String,
        #[arg(short, long)]
        user_id: Option<String>,
        #[arg(short, long)]
        email: Option<String>,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ProgressCommand {
    Show { user: String },
}

#[tokio::main]
async fn main() {
    let _guard = init_log(None);
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(database) = args.database {
        config.database = database;
    }

    if let Commands::Capability {
        user,
        admin,
        ttl_minutes,
    } = &args.command
    {
        let secrets = Secrets::from_env()?;
        let role = if *admin { Role::Admin } else { Role::Learner };
        let ttl = ttl_minutes.unwrap_or(config.capability_ttl_minutes);
        let token = CapabilityKeys::new(&secrets.capability_secret).issue(
            user,
            role,
            time::Duration::minutes(ttl),
        )?;
        println!("{token}");
        return Ok(());
    }

    let database = db::open(&config.database).await?;
    match args.command {
        Commands::InitDb => println!("Database ready at {}", config.database.display()),
        Commands::AnswerKey { command } => match command {
            AnswerKeyCommand::Load { quiz, file } => load_answer_key(&database, &quiz, file).await?,
        },
        Commands::Coupon { command } => coupon_command(&database, command).await?,
        Commands::Certificate { command } => match command {
            CertificateCommand::Revoke { id } => {
                let revocation = certificate::revoke(&database, &id, OPERATOR).await?;
                if revocation.already_revoked {
                    println!("Certificate {} was already revoked", id);
                } else {
                    println!("Certificate {} revoked", id);
                }
            }
            CertificateCommand::Verify { id, user_id, email } => {
                let query = VerificationQuery {
                    certificate_id: id,
                    user_id,
                    email,
                };
                let result = certificate::verify(&database, &query).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        },
        Commands::Progress { command } => match command {
            ProgressCommand::Show { user } => {
                let progress = progress::load(&database, &user, config.chapter_count).await?;
                println!("{}", serde_json::to_string_pretty(&progress)?);
            }
        },
        Commands::Capability { .. } => {}
    }
    Ok(())
}

async fn load_answer_key(database: &SqlitePool, quiz: &str, file: PathBuf) -> anyhow::Result<()> {
    let quiz_ref: QuizRef = quiz.parse()?;
    let content = tokio::fs::read_to_string(&file).await?;
    let answers: BTreeMap<String, String> = serde_json::from_str(&content)?;
    let stored = quiz::store_answer_key(database, quiz_ref, &answers).await?;
    println!("Stored {} answers for {} from {}", stored, quiz_ref, file.display());
    Ok(())
}

async fn coupon_command(database: &SqlitePool, command: CouponCommand) -> anyhow::Result<()> {
    match command {
        CouponCommand::Create {
            code,
            discount,
            max_uses,
            expires_in_days,
        } => {
            let new = NewCoupon {
                code,
                discount_percentage: discount,
                max_uses,
                expires_in_days,
            };
            let coupon = coupon::create_coupon(database, &new, OPERATOR).await?;
            println!("Coupon {} created ({}% off)", coupon.code, coupon.discount_percentage);
        }
        CouponCommand::Batch {
            count,
            prefix,
            discount,
            max_uses,
            expires_in_days,
        } => {
            let request = BatchRequest {
                count,
                prefix,
                discount_percentage: discount,
                max_uses,
                expires_in_days,
            };
            for coupon in coupon::generate_batch(database, &request, OPERATOR).await? {
                println!("{}", coupon.code);
            }
        }
        CouponCommand::List => {
            for coupon in coupon::list_coupons(database).await? {
                let uses = match coupon.max_uses {
                    0 => format!("{}/unlimited", coupon.used_count),
                    max => format!("{}/{}", coupon.used_count, max),
                };
                println!("{:<20} {:>3}% {:>14}", coupon.code, coupon.discount_percentage, uses);
            }
        }
        CouponCommand::Usage { code } => {
            for usage in coupon::coupon_usage(database, &code).await? {
                println!("{:<36} {}", usage.user_id, usage.used_at);
            }
        }
    }
    Ok(())
}

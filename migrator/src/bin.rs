use anyhow::{Context, Result};
use clap::{App, Arg, SubCommand};
use migrator::Migrator;
use uuid::Uuid;

#[tokio::main]
pub async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _ = env_logger::try_init();

    let options = App::new("migrator")
        .version("1.0")
        .about("Migrator bulk-loads CSV files into SQL Server tables, inferring destination types as it goes.")
        .arg(Arg::with_name("connection_string")
            .long("connection-string")
            .help("ADO connection string for the destination SQL Server; falls back to $MIGRATOR_CONNECTION_STRING")
            .takes_value(true))
        .subcommand(SubCommand::with_name("submit")
            .about("Discover CSV files under a root folder and submit a new migration Job")
            .arg(Arg::with_name("root_folder").required(true).takes_value(true)))
        .subcommand(SubCommand::with_name("reprocess-job")
            .about("Resubmit a previous Job, rediscovering files from its root folder")
            .arg(Arg::with_name("job_id").required(true).takes_value(true)))
        .subcommand(SubCommand::with_name("reprocess-file")
            .about("Resubmit a single JobFile from a previous Job")
            .arg(Arg::with_name("job_id").required(true).takes_value(true))
            .arg(Arg::with_name("file_id").required(true).takes_value(true)))
        .subcommand(SubCommand::with_name("test-connection")
            .about("Check connectivity to the destination SQL Server without running a Job"))
        .subcommand(SubCommand::with_name("init-schema")
            .about("Create the control-plane tables (Jobs/JobFiles/JobErrors/JobMetrics) if missing"))
        .subcommand(SubCommand::with_name("get-job")
            .about("Print one Job and its files")
            .arg(Arg::with_name("job_id").required(true).takes_value(true)))
        .subcommand(SubCommand::with_name("list-jobs")
            .about("List every Job"))
        .get_matches();

    let connection_string = options.value_of("connection_string")
        .map(str::to_string)
        .or_else(|| std::env::var("MIGRATOR_CONNECTION_STRING").ok())
        .context("no connection string: pass --connection-string or set MIGRATOR_CONNECTION_STRING")?;

    match options.subcommand() {
        ("submit", Some(args)) => {
            let migrator = Migrator::connect(connection_string).await?;
            let root_folder = args.value_of("root_folder").expect("root_folder is required").to_string();
            let job_id = migrator.submit_job(root_folder).await?;
            println!("submitted job {}", job_id);
            migrator.shutdown().await?;
        }
        ("reprocess-job", Some(args)) => {
            let migrator = Migrator::connect(connection_string).await?;
            let orig_job_id = parse_uuid(args.value_of("job_id"))?;
            let job_id = migrator.submit_reprocess_job(orig_job_id).await?;
            println!("submitted reprocess job {}", job_id);
            migrator.shutdown().await?;
        }
        ("reprocess-file", Some(args)) => {
            let migrator = Migrator::connect(connection_string).await?;
            let orig_job_id = parse_uuid(args.value_of("job_id"))?;
            let file_id = parse_uuid(args.value_of("file_id"))?;
            let job_id = migrator.submit_reprocess_file(orig_job_id, file_id).await?;
            println!("submitted reprocess-file job {}", job_id);
            migrator.shutdown().await?;
        }
        ("test-connection", Some(_)) => {
            let result = Migrator::test_connection(&connection_string).await;
            println!("{:?}", result);
        }
        ("init-schema", Some(_)) => {
            let migrator = Migrator::connect(connection_string).await?;
            migrator.shutdown().await?;
            println!("schema initialized");
        }
        ("get-job", Some(args)) => {
            let migrator = Migrator::connect(connection_string).await?;
            let job_id = parse_uuid(args.value_of("job_id"))?;
            let job = migrator.get_job(job_id).await?.context("job not found")?;
            println!("{:#?}", job);
            for file in migrator.get_job_files(job_id).await? {
                println!("{:#?}", file);
            }
            migrator.shutdown().await?;
        }
        ("list-jobs", Some(_)) => {
            let migrator = Migrator::connect(connection_string).await?;
            for job in migrator.get_all_jobs().await? {
                println!("{} {:?} {} ({}/{} files)", job.id, job.status, job.root_folder, job.processed_files, job.total_files);
            }
            migrator.shutdown().await?;
        }
        _ => {
            eprintln!("{}", options.usage());
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_uuid(value: Option<&str>) -> Result<Uuid> {
    let raw = value.context("missing id argument")?;
    Uuid::parse_str(raw).with_context(|| format!("{} is not a valid uuid", raw))
}

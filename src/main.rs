use chrono::Local;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finsight::config::Config;
use finsight::db;
use finsight::scheduler::{
    DEFAULT_MISFIRE_GRACE, LifecycleManager, Scheduler, Trigger, load_state_file,
};
use finsight::services::{
    BaiduSearchClient, DeepAnalyzer, EmailSender, ImpactAnalyzer, ImportanceScorer, LlmClient,
    NewsCollector, NewsStore, PipelineOrchestrator, ProviderKind, ProviderProfile,
};
use finsight::utils::SlidingWindowLimiter;

#[derive(Parser, Debug)]
#[command(name = "finsight")]
#[command(version, about = "AI news collection and market impact analysis")]
struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler in the foreground with the monitoring UI
    Start,
    /// Run the scheduler in the foreground without UI (containers)
    #[command(alias = "daemon")]
    Background,
    /// Read the persisted scheduler state and print a report
    Status,
    /// Execute one full pipeline cycle synchronously
    RunOnce,
    /// Execute the daily-summary dispatch once
    Summary,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        },
    };

    let _log_guard = init_logging(&config);
    tracing::info!("Finsight starting up");

    let result = match cli.command {
        Command::Start => run_scheduler(&config, true).await,
        Command::Background => run_scheduler(&config, false).await,
        Command::Status => print_status(&config),
        Command::RunOnce => run_once(&config).await,
        Command::Summary => run_summary(&config).await,
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Console layer always; daily-rolling file layer when configured
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("data/logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("finsight.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    }
}

/// Wire the full service graph from configuration
async fn build_pipeline(config: &Config) -> anyhow::Result<Arc<PipelineOrchestrator>> {
    let pool = db::create_pool(&config.database.sqlite.db_path).await?;
    tracing::info!("Database ready at {}", config.database.sqlite.db_path);

    let store = Arc::new(NewsStore::new(pool));

    let kind = ProviderKind::parse_kind(&config.ai_analysis.provider);
    let profile = ProviderProfile::from_config(kind, config.active_provider())?;
    let params = config.ai_analysis.analysis_params.clone();
    let llm: Arc<LlmClient> = Arc::new(LlmClient::new(
        profile,
        params.retry_count,
        Duration::from_secs(params.fallback_timeout),
    )?);

    let limiter = Arc::new(SlidingWindowLimiter::per_minute(params.rate_limit));

    let collector = Arc::new(NewsCollector::new(config.news_collection.sources.rss_feeds.clone()));
    let importance = ImportanceScorer::new(llm.clone(), Duration::from_secs(params.timeout));
    let impact = Arc::new(ImpactAnalyzer::new(llm.clone(), limiter, params));

    let deep = if config.ai_analysis.deep_analysis.enabled {
        Some(Arc::new(DeepAnalyzer::new(
            llm.clone(),
            Arc::new(BaiduSearchClient::new()),
            config.ai_analysis.deep_analysis.clone(),
        )))
    } else {
        None
    };

    let email = if config.email.is_configured() {
        Some(Arc::new(EmailSender::new(config.email.clone())?))
    } else {
        tracing::warn!("Email not configured; dispatch cycles will render but not send");
        None
    };

    let log_dir = config
        .logging
        .file
        .as_ref()
        .and_then(|f| Path::new(f).parent().map(Path::to_path_buf));

    Ok(Arc::new(PipelineOrchestrator::new(
        store,
        collector,
        importance,
        impact,
        deep,
        email,
        config.database.retention.max_days,
        log_dir,
    )))
}

/// Register the configured job set on a fresh scheduler
fn register_jobs(
    scheduler: &Scheduler,
    pipeline: &Arc<PipelineOrchestrator>,
    config: &Config,
) {
    macro_rules! job_action {
        ($method:ident) => {{
            let pipeline = Arc::clone(pipeline);
            Arc::new(move || {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.$method().await }
            })
        }};
    }

    if config.scheduler.mode == "simple" {
        let pipeline = Arc::clone(pipeline);
        scheduler.add_job(
            "full_pipeline",
            "完整流程任务",
            Trigger::every_minutes(config.scheduler.pipeline_interval),
            Duration::from_secs(900),
            Arc::new(move || {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.full_cycle().await.map(|_| ()) }
            }),
        );
    } else {
        let strategy = &config.scheduler.strategy;

        if strategy.morning_collection.enabled {
            scheduler.add_job(
                "morning_collection",
                "早间收集并发送邮件",
                Trigger::daily(strategy.morning_collection.hour, strategy.morning_collection.minute),
                DEFAULT_MISFIRE_GRACE,
                job_action!(morning_digest),
            );
        }

        if strategy.trading_hours.enabled {
            scheduler.add_job(
                "trading_hours_collection",
                "交易时间收集",
                Trigger::every_minutes(strategy.trading_hours.interval_minutes),
                Duration::from_secs(60),
                job_action!(intraday_tick),
            );
        }

        if strategy.evening_collection.enabled {
            scheduler.add_job(
                "evening_collection",
                "晚间收集",
                Trigger::daily(strategy.evening_collection.hour, strategy.evening_collection.minute),
                DEFAULT_MISFIRE_GRACE,
                job_action!(evening_collection),
            );
        }

        if strategy.daily_summary.enabled {
            scheduler.add_job(
                "daily_summary",
                "每日汇总邮件",
                Trigger::daily(strategy.daily_summary.hour, strategy.daily_summary.minute),
                Duration::from_secs(1800),
                job_action!(daily_summary),
            );
        }
    }

    scheduler.add_job(
        "maintenance",
        "维护任务",
        Trigger::daily(3, 0),
        DEFAULT_MISFIRE_GRACE,
        job_action!(maintenance),
    );
}

async fn run_scheduler(config: &Config, with_ui: bool) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config).await?;

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(events_tx));
    register_jobs(&scheduler, &pipeline, config);

    let mut components = BTreeMap::new();
    components.insert("store".to_string(), true);
    components.insert("llm".to_string(), true);
    components.insert("email".to_string(), config.email.is_configured());

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&scheduler),
        &config.scheduler.state_file,
        Duration::from_secs(config.scheduler.monitor_interval_secs),
        components,
    ));

    lifecycle.restore_previous_state();
    lifecycle.mark_started();

    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run());
    let event_handle = tokio::spawn(Arc::clone(&lifecycle).run_event_loop(events_rx));
    let monitor_handle = tokio::spawn(Arc::clone(&lifecycle).run_monitor_loop());

    tracing::info!(
        "Scheduler started with {} jobs ({} strategy)",
        scheduler.job_count(),
        config.scheduler.mode
    );

    if with_ui {
        run_dashboard(&scheduler, &lifecycle).await;
    } else {
        let signal = LifecycleManager::wait_for_signal().await;
        tracing::info!("Received {}, shutting down", signal);
        lifecycle.initiate_shutdown(&format!("接收到信号 {}", signal));
    }

    scheduler_handle.await.ok();
    monitor_handle.await.ok();
    lifecycle.mark_stopped();
    event_handle.abort();

    tracing::info!("Finsight stopped");
    Ok(())
}

/// Console dashboard refreshed every 5 seconds until a signal arrives
async fn run_dashboard(scheduler: &Arc<Scheduler>, lifecycle: &Arc<LifecycleManager>) {
    loop {
        let snapshot = lifecycle.state_snapshot();
        let jobs = scheduler.job_snapshots();

        print!("\x1b[2J\x1b[H");
        println!("{}", "=".repeat(78));
        println!("📊 Finsight - AI新闻收集与影响分析系统");
        println!("{}", "=".repeat(78));
        println!();
        println!(
            "🔧 运行状态: {}   启动时间: {}",
            if snapshot.is_running { "🟢 运行中" } else { "🔴 已停止" },
            snapshot
                .start_time
                .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "未知".to_string()),
        );
        println!(
            "💊 健康状态: {}   失败率: {:.1}%   错误次数: {}",
            snapshot.health_status.overall.as_str(),
            snapshot.health_status.failure_rate * 100.0,
            snapshot.error_count,
        );
        println!(
            "📈 执行统计: 总 {} | 成功 {} | 失败 {}",
            snapshot.stats.total_executions,
            snapshot.stats.successful_executions,
            snapshot.stats.failed_executions,
        );
        println!();
        println!("⏰ 活动任务 ({}个):", jobs.len());
        for job in &jobs {
            println!(
                "  📋 {} [{}] 下次执行: {}{}",
                job.name,
                job.trigger,
                job.next_fire.format("%H:%M:%S"),
                if job.running { " (执行中)" } else { "" },
            );
        }
        println!();
        println!("📝 最近事件:");
        for event in snapshot.execution_history.iter().rev().take(5).rev() {
            println!(
                "  {} {} {}",
                event.timestamp.with_timezone(&Local).format("%H:%M:%S"),
                if event.success { "✅" } else { "❌" },
                event.message,
            );
        }
        println!();
        println!("按 Ctrl+C 停止调度器");

        tokio::select! {
            signal = LifecycleManager::wait_for_signal() => {
                println!("\n接收到停止信号...");
                lifecycle.initiate_shutdown(&format!("接收到信号 {}", signal));
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

/// `status`: report from the persisted state file, cross-checked
/// against the OS process table.
fn print_status(config: &Config) -> anyhow::Result<()> {
    let path = PathBuf::from(&config.scheduler.state_file);
    let Some(state) = load_state_file(&path) else {
        println!("📊 调度器状态: 无状态文件 ({})", path.display());
        return Ok(());
    };

    let pid_alive = process_alive(state.process_id);
    let effective_running = state.is_running && pid_alive.unwrap_or(false);

    println!("📊 调度器状态:");
    println!(
        "   运行状态: {}",
        if effective_running { "运行中" } else { "已停止" }
    );
    println!(
        "   进程PID: {} ({})",
        state.process_id,
        match pid_alive {
            Some(true) => "存活",
            Some(false) => "不存在",
            None => "无法检测",
        }
    );
    println!(
        "   启动时间: {}",
        state
            .start_time
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "N/A".to_string())
    );
    println!("   健康状态: {}", state.health_status.overall.as_str());
    println!(
        "   执行统计: 总 {} | 成功 {} | 失败 {} (失败率 {:.1}%)",
        state.stats.total_executions,
        state.stats.successful_executions,
        state.stats.failed_executions,
        state.stats.failure_rate() * 100.0,
    );
    println!("   错误次数: {}", state.error_count);
    println!(
        "   状态保存: {}",
        state
            .saved_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "N/A".to_string())
    );

    if !state.execution_history.is_empty() {
        println!("   最近事件:");
        for event in state.execution_history.iter().rev().take(5) {
            println!(
                "     {} {} {}",
                event.timestamp.with_timezone(&Local).format("%m-%d %H:%M"),
                if event.success { "✅" } else { "❌" },
                event.message,
            );
        }
    }

    Ok(())
}

/// PID liveness via /proc on Linux; unknown elsewhere
fn process_alive(pid: u32) -> Option<bool> {
    if pid == 0 {
        return Some(false);
    }
    #[cfg(target_os = "linux")]
    {
        Some(Path::new(&format!("/proc/{}", pid)).exists())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

async fn run_once(config: &Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config).await?;
    tracing::info!("Running one full pipeline cycle");

    let outcome = pipeline.full_cycle().await?;
    println!(
        "完整流程执行完成: 抓取 {} 条，新增 {} 条，深度分析 {} 条",
        outcome.fetched,
        outcome.saved,
        outcome.deep_results.len(),
    );
    Ok(())
}

async fn run_summary(config: &Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config).await?;
    tracing::info!("Running daily summary dispatch");
    pipeline.daily_summary().await?;
    println!("每日汇总执行完成");
    Ok(())
}

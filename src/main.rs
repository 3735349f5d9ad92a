use anyhow::Context;
use futures::future::join_all;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dlqueue::cli;
use dlqueue::core::{DownloadId, DownloadRequest, Downloader, EngineBuilder, Status};
use dlqueue::storage::AutoGrant;
use dlqueue::ui::{self, DownloadSummary, ProgressManager};
use dlqueue::utils::validator;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[actix::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("程序启动");

    let (args, config) = match cli::Args::parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            log::error!("参数解析失败: {}", e);
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };
    let urls = args.get_urls().context("获取URL列表失败")?;
    let headers = args.get_headers().context("解析请求头失败")?;
    validator::validate_output_path(&config.download_dir)?;

    log::info!("配置文件路径: {}", args.config);
    log::info!("配置摘要:\n{}", config.get_summary());
    println!("{}", config.get_summary());

    let download_dir = config.download_dir.clone();
    let ctx = EngineBuilder::new(config, Arc::new(AutoGrant))
        .build()
        .context("下载引擎初始化失败")?;
    let downloader = Downloader::start(ctx)?;

    if args.wants_eviction() {
        let days = downloader.context().config.stale_after_days;
        let evicted = downloader.evict_expired_transfers().await?;
        ui::print_success(&format!("清理了 {} 个超过 {} 天的未完成下载", evicted, days));
    }
    if urls.is_empty() {
        if !args.wants_eviction() {
            validator::validate_urls(&urls)?;
        }
        return Ok(());
    }

    let progress = ProgressManager::new();
    let mut ids = Vec::new();
    for url in &urls {
        let file_name = match (&args.file_name, urls.len()) {
            (Some(name), 1) => name.clone(),
            _ => validator::file_name_from_url(url)
                .unwrap_or_else(|| format!("download_{}", chrono::Utc::now().timestamp())),
        };
        let request = DownloadRequest::builder(url.as_str(), &download_dir, file_name.as_str())
            .priority(args.priority)
            .headers(headers.clone())
            .build();
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                ui::print_error(&format!("无效的下载请求: {} - {}", url, e));
                continue;
            }
        };

        let bar = progress.add_progress_bar(&file_name);
        match request.start(&downloader, progress.listeners(bar)).await {
            Ok(id) => {
                log::info!("创建下载任务 {}: {} -> {}", id, url, file_name);
                ids.push(id);
            }
            Err(e) => {
                log::error!("创建下载任务失败: {} - {}", url, e);
                progress.println(&format!("✗ 创建下载任务失败: {} - {}", url, e));
            }
        }
    }

    if ids.is_empty() {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    progress.println("按 'p' 暂停/恢复, 'c' 取消, 'q' 退出");
    let started = Instant::now();
    run_download_loop(&downloader, &ids).await?;

    let mut summary = DownloadSummary {
        total_files: ids.len(),
        total_size: 0,
        elapsed_time: started.elapsed(),
        success_count: 0,
        paused_count: 0,
        cancelled_count: 0,
        failed_count: 0,
    };
    let statuses = join_all(ids.iter().map(|id| downloader.status(*id))).await;
    for (id, status) in ids.iter().zip(statuses) {
        match status {
            Status::Completed => {
                summary.success_count += 1;
                if let Some(p) = downloader.progress(*id).await {
                    summary.total_size += p.current_bytes;
                }
            }
            Status::Cancelled => summary.cancelled_count += 1,
            Status::Failed => summary.failed_count += 1,
            _ => summary.paused_count += 1,
        }
    }
    println!("{}", summary);
    log::info!(
        "下载结束 - 成功: {}, 失败: {}, 取消: {}",
        summary.success_count,
        summary.failed_count,
        summary.cancelled_count
    );
    Ok(())
}

fn poll_key(timeout: Duration) -> Option<KeyCode> {
    match event::poll(timeout) {
        Ok(true) => match event::read() {
            Ok(Event::Key(key_event)) => Some(key_event.code),
            _ => None,
        },
        _ => None,
    }
}

/// 运行下载主循环：处理键盘输入，所有任务结束后退出
async fn run_download_loop(downloader: &Downloader, ids: &[DownloadId]) -> anyhow::Result<()> {
    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;

    let result = key_loop(downloader, ids).await;

    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    result
}

async fn key_loop(downloader: &Downloader, ids: &[DownloadId]) -> anyhow::Result<()> {
    let mut paused = false;
    let mut last_check = Instant::now();

    loop {
        // 轮询键盘会阻塞，不能占用队列所在的线程
        if let Some(code) = tokio::task::spawn_blocking(|| poll_key(KEYBOARD_POLL_INTERVAL)).await? {
            match code {
                KeyCode::Char('q') | KeyCode::Char('Q') => {
                    log::info!("用户主动退出");
                    for id in ids {
                        downloader.pause(*id).await?;
                    }
                    break;
                }
                KeyCode::Char('p') | KeyCode::Char('P') => {
                    paused = !paused;
                    let results = if paused {
                        join_all(ids.iter().map(|id| downloader.pause(*id))).await
                    } else {
                        join_all(ids.iter().map(|id| downloader.resume(*id))).await
                    };
                    results.into_iter().collect::<Result<Vec<_>, _>>()?;
                    log::info!("用户{}所有下载任务", if paused { "暂停" } else { "恢复" });
                }
                KeyCode::Char('c') | KeyCode::Char('C') => {
                    let cancelled = downloader.cancel_all().await?;
                    log::info!("用户取消了 {} 个下载任务", cancelled);
                    break;
                }
                _ => {}
            }
        }

        if last_check.elapsed() >= STATUS_POLL_INTERVAL {
            let statuses = join_all(ids.iter().map(|id| downloader.status(*id))).await;
            if statuses.iter().all(|s| s.is_terminal()) {
                break;
            }
            last_check = Instant::now();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // 等待暂停和取消的事件投递完
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::events::Listeners;

const BAR_TEMPLATE: &str = "{prefix:6} {msg:24} [{bar:30.cyan/blue}] {bytes}/{total_bytes} | {bytes_per_sec} | ETA:{eta}";
const SPINNER_TEMPLATE: &str = "{prefix:6} {msg:24} {spinner} {bytes} | {bytes_per_sec}";

// 结构体：ProgressManager
// 每个下载任务一个进度条，由事件回调驱动
pub struct ProgressManager {
    multi: MultiProgress,
}

impl ProgressManager {
    pub fn new() -> Self {
        ProgressManager {
            multi: MultiProgress::new(),
        }
    }

    // 添加进度条，长度未知时显示为转圈
    pub fn add_progress_bar(&self, name: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(spinner_style());
        pb.set_message(name.to_string());
        pb
    }

    // 生成更新进度条的回调
    pub fn listeners(&self, pb: ProgressBar) -> Listeners {
        let (start, progress, pause, cancel, complete, error) =
            (pb.clone(), pb.clone(), pb.clone(), pb.clone(), pb.clone(), pb);
        Listeners::new()
            .on_start_or_resume(move || start.set_prefix("下载中"))
            .on_progress(move |p| {
                if p.total_bytes > 0 && progress.length() != Some(p.total_bytes) {
                    progress.set_length(p.total_bytes);
                    progress.set_style(bar_style());
                }
                progress.set_position(p.current_bytes);
            })
            .on_pause(move || pause.set_prefix("已暂停"))
            .on_cancel(move || cancel.abandon_with_message("已取消"))
            .on_complete(move || complete.finish())
            .on_error(move |e| error.abandon_with_message(format!("失败: {}", e)))
    }

    pub fn println(&self, message: &str) {
        let _ = self.multi.println(message);
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

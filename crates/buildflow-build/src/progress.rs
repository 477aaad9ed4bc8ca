//! ビルド進捗の出力
//!
//! 人間向けのステータス行と、プッシュ進捗などの構造化イベントを
//! 同じ出力先に書き出します。JSONモードでは1行1メッセージの
//! JSONストリーム（Docker Engine API と同じ形式）になります。

use colored::Colorize;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

type SharedWriter = Arc<Mutex<dyn Write + Send>>;

fn lock_err() -> io::Error {
    io::Error::other("progress writer lock poisoned")
}

/// 1回のビルド呼び出しに紐づく進捗出力
///
/// ビルドごとに作成し、並行するビルド間で共有しない。
#[derive(Clone)]
pub struct ProgressWriter {
    pub stdout: StdoutFormatter,
}

impl ProgressWriter {
    pub fn new<W: Write + Send + 'static>(writer: W, json: bool) -> Self {
        Self {
            stdout: StdoutFormatter {
                writer: Arc::new(Mutex::new(writer)),
                json,
            },
        }
    }

    /// プロセスの標準出力に書き出す
    pub fn stdout(json: bool) -> Self {
        Self::new(io::stdout(), json)
    }

    /// メモリ上のバッファに書き出す（出力の検査用）
    pub fn buffer(json: bool) -> (Self, OutputBuffer) {
        let buffer = OutputBuffer::default();
        (Self::new(buffer.clone(), json), buffer)
    }
}

/// テキスト出力のフォーマッタ
///
/// `write!` で書かれた内容は、JSONモードでは `{"stream": "..."}` 行に包まれる。
#[derive(Clone)]
pub struct StdoutFormatter {
    writer: SharedWriter,
    json: bool,
}

impl StdoutFormatter {
    pub fn is_json(&self) -> bool {
        self.json
    }

    /// 構造化イベント用の出力を派生させる
    pub fn progress_output(&self) -> ProgressOutput {
        ProgressOutput {
            writer: self.writer.clone(),
            json: self.json,
        }
    }
}

#[derive(Serialize)]
struct StreamMessage<'a> {
    stream: &'a str,
}

impl Write for StdoutFormatter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().map_err(|_| lock_err())?;
        if self.json {
            let text = String::from_utf8_lossy(buf);
            let line = serde_json::to_string(&StreamMessage { stream: &text })?;
            writeln!(writer, "{}", line)?;
        } else {
            writer.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.lock().map_err(|_| lock_err())?.flush()
    }
}

/// 構造化された進捗イベント
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressEvent {
    /// レイヤーIDなどの対象識別子
    pub id: String,
    /// 状態（"Pushing", "Pushed", "Layer already exists" など）
    pub action: String,
    /// 人間向けの進捗バー文字列
    pub progress: Option<String>,
    pub current: Option<i64>,
    pub total: Option<i64>,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct ProgressDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressMessage<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_detail: Option<ProgressDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<&'a str>,
}

/// 構造化イベントの出力先
#[derive(Clone)]
pub struct ProgressOutput {
    writer: SharedWriter,
    json: bool,
}

impl ProgressOutput {
    pub fn write_progress(&self, event: &ProgressEvent) -> io::Result<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_err())?;

        if self.json {
            let detail = (event.current.is_some() || event.total.is_some()).then_some(
                ProgressDetail {
                    current: event.current,
                    total: event.total,
                },
            );
            let line = serde_json::to_string(&ProgressMessage {
                status: &event.action,
                id: &event.id,
                progress_detail: detail,
                progress: event.progress.as_deref(),
            })?;
            return writeln!(writer, "{}", line);
        }

        let prefix = if event.id.is_empty() {
            String::new()
        } else {
            format!("{}: ", event.id)
        };
        match event.action.as_str() {
            // 準備中は表示をスキップ（ノイズ軽減）
            "Preparing" | "Waiting" => Ok(()),
            "Pushed" | "Layer already exists" => {
                writeln!(writer, "  {} {}{}", "✓".green(), prefix, event.action)
            }
            _ => match &event.progress {
                Some(bar) => writeln!(writer, "  ↑ {}{} {}", prefix, event.action, bar),
                None => writeln!(writer, "  {}{}", prefix, event.action),
            },
        }
    }
}

/// 共有メモリバッファ
#[derive(Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().map_err(|_| lock_err())?.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_mode_passes_through() {
        let (progress, buffer) = ProgressWriter::buffer(false);
        let mut stdout = progress.stdout.clone();
        writeln!(stdout, "Successfully built {}", "abc123").unwrap();
        assert_eq!(buffer.contents(), "Successfully built abc123\n");
    }

    #[test]
    fn test_json_mode_wraps_stream() {
        let (progress, buffer) = ProgressWriter::buffer(true);
        let mut stdout = progress.stdout.clone();
        stdout.write_all(b"Step 1/2\n").unwrap();

        let line: serde_json::Value = serde_json::from_str(buffer.contents().trim()).unwrap();
        assert_eq!(line["stream"], "Step 1/2\n");
    }

    #[test]
    fn test_json_progress_event() {
        let (progress, buffer) = ProgressWriter::buffer(true);
        let output = progress.stdout.progress_output();
        output
            .write_progress(&ProgressEvent {
                id: "a1b2c3".to_string(),
                action: "Pushing".to_string(),
                progress: Some("[==>  ]".to_string()),
                current: Some(512),
                total: Some(2048),
            })
            .unwrap();

        let line: serde_json::Value = serde_json::from_str(buffer.contents().trim()).unwrap();
        assert_eq!(line["status"], "Pushing");
        assert_eq!(line["id"], "a1b2c3");
        assert_eq!(line["progressDetail"]["current"], 512);
        assert_eq!(line["progressDetail"]["total"], 2048);
    }

    #[test]
    fn test_text_progress_skips_preparing() {
        let (progress, buffer) = ProgressWriter::buffer(false);
        let output = progress.stdout.progress_output();
        output
            .write_progress(&ProgressEvent::new("a1b2c3", "Preparing"))
            .unwrap();
        assert!(buffer.contents().is_empty());

        output
            .write_progress(&ProgressEvent::new("a1b2c3", "Pushed"))
            .unwrap();
        assert!(buffer.contents().contains("a1b2c3: Pushed"));
    }
}

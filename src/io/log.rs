// ============================================================================
// src/io/log.rs - Kernel Logging using the `log` crate
// ============================================================================
//!
//! ドライバ用ロギングシステム。
//!
//! ## 機能
//! - `log`クレートを使用した標準的なログインターフェース
//! - 1レコード = 1行 の行指向シンク ([`LineSink`]) へ出力
//! - デフォルトシンクは COM1 シリアル（`serial` feature で uart_16550）
//! - コンパイル時のログレベルフィルタリング
//! - マルチコア安全なSpinlock保護
//!
//! ## 使用方法
//! ```rust,ignore
//! use log::{info, warn};
//!
//! xhci_kernel::io::log::init()?;
//! info!("xHCI: controller running");
//! ```

use alloc::string::String;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

// ============================================================================
// ログレベル定義
// ============================================================================

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// 現在のログレベル（実行時変更可能）
static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

// ============================================================================
// Line Sink
// ============================================================================

/// 行指向のテキスト出力先
pub trait LineSink: Sync {
    /// 改行を含まない1行を書き込む
    fn write_line(&self, line: &str);
}

/// COM1 へ直接ポートI/Oで書き込むシンク
#[cfg(target_arch = "x86_64")]
pub struct Com1Sink;

#[cfg(target_arch = "x86_64")]
impl Com1Sink {
    /// シリアルポートベースアドレス (COM1)
    const BASE: u16 = 0x3F8;
    /// ラインステータスレジスタオフセット
    const LSR_OFFSET: u16 = 5;
    /// 送信バッファ空きビット (LSR bit 5)
    const LSR_TX_EMPTY: u8 = 0x20;
    /// 送信待機タイムアウト（ループ回数）
    const TX_TIMEOUT_LOOPS: u32 = 100_000;

    fn write_byte(byte: u8) {
        use x86_64::instructions::port::Port;

        let mut status: Port<u8> = Port::new(Self::BASE + Self::LSR_OFFSET);
        let mut data: Port<u8> = Port::new(Self::BASE);
        // SAFETY: COM1 は標準のI/Oポート
        unsafe {
            let mut timeout = Self::TX_TIMEOUT_LOOPS;
            while (status.read() & Self::LSR_TX_EMPTY) == 0 && timeout > 0 {
                core::hint::spin_loop();
                timeout -= 1;
            }
            if timeout > 0 {
                data.write(byte);
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl LineSink for Com1Sink {
    fn write_line(&self, line: &str) {
        for byte in line.bytes() {
            Self::write_byte(byte);
        }
        Self::write_byte(b'\r');
        Self::write_byte(b'\n');
    }
}

/// uart_16550 経由のシリアルシンク
#[cfg(feature = "serial")]
pub struct Uart16550Sink {
    port: Mutex<uart_16550::SerialPort>,
}

#[cfg(feature = "serial")]
impl Uart16550Sink {
    /// # Safety
    /// `base` は有効な 16550 UART の I/O ポートでなければならない。
    pub unsafe fn new(base: u16) -> Self {
        // SAFETY: 呼び出し側が保証
        let mut port = unsafe { uart_16550::SerialPort::new(base) };
        port.init();
        Self {
            port: Mutex::new(port),
        }
    }
}

#[cfg(feature = "serial")]
impl LineSink for Uart16550Sink {
    fn write_line(&self, line: &str) {
        let mut port = self.port.lock();
        let _ = port.write_str(line);
        let _ = port.write_str("\r\n");
    }
}

// ============================================================================
// ロガー実装
// ============================================================================

/// ドライバ用ロガー
struct KernelLogger {
    sink: Mutex<Option<&'static dyn LineSink>>,
}

impl KernelLogger {
    /// ログレベルのプレフィックスを取得
    fn level_prefix(level: Level) -> &'static str {
        match level {
            Level::Error => "[ERROR] ",
            Level::Warn => "[WARN]  ",
            Level::Info => "[INFO]  ",
            Level::Debug => "[DEBUG] ",
            Level::Trace => "[TRACE] ",
        }
    }
}

/// 1レコードを1行に整形
pub(crate) fn format_line(level: Level, module: Option<&str>, args: fmt::Arguments<'_>) -> String {
    let mut line = String::new();
    line.push_str(KernelLogger::level_prefix(level));
    if let Some(module) = module {
        line.push('[');
        line.push_str(module);
        line.push_str("] ");
    }
    let _ = line.write_fmt(args);
    line
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let current_level = LevelFilter::iter()
            .nth(CURRENT_LOG_LEVEL.load(Ordering::Relaxed) as usize)
            .unwrap_or(LevelFilter::Info);
        metadata.level() <= current_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), record.module_path(), *record.args());

        // 行単位で出力を直列化
        let sink = self.sink.lock();
        if let Some(sink) = *sink {
            sink.write_line(&line);
        }
    }

    fn flush(&self) {}
}

/// グローバルロガーインスタンス
static LOGGER: KernelLogger = KernelLogger {
    sink: Mutex::new(None),
};

// ============================================================================
// 公開API
// ============================================================================

/// 任意のシンクでロギングを初期化
///
/// 二度目以降の呼び出しはシンクだけを差し替え、`SetLoggerError` を返す。
pub fn init_with_sink(sink: &'static dyn LineSink) -> Result<(), SetLoggerError> {
    *LOGGER.sink.lock() = Some(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(MAX_LOG_LEVEL);
    CURRENT_LOG_LEVEL.store(MAX_LOG_LEVEL as u8, Ordering::SeqCst);
    Ok(())
}

/// COM1 シリアルでロギングを初期化
#[cfg(all(target_arch = "x86_64", not(feature = "serial")))]
pub fn init() -> Result<(), SetLoggerError> {
    static COM1: Com1Sink = Com1Sink;
    init_with_sink(&COM1)
}

/// uart_16550 経由でロギングを初期化
#[cfg(feature = "serial")]
pub fn init() -> Result<(), SetLoggerError> {
    static UART: spin::Once<Uart16550Sink> = spin::Once::new();
    // SAFETY: 0x3F8 は COM1
    let sink = UART.call_once(|| unsafe { Uart16550Sink::new(0x3F8) });
    init_with_sink(sink)
}

/// 実行時にログレベルを変更（コンパイル時上限を超えない）
pub fn set_log_level(level: LevelFilter) {
    let level = level.min(MAX_LOG_LEVEL);
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::SeqCst);
    log::set_max_level(level);
}

/// 現在のログレベル
pub fn log_level() -> LevelFilter {
    LevelFilter::iter()
        .nth(CURRENT_LOG_LEVEL.load(Ordering::Relaxed) as usize)
        .unwrap_or(LevelFilter::Info)
}

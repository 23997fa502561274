// ============================================================================
// src/io/usb/xhci/wait.rs - Bounded Polling Policy
// ============================================================================
//!
//! ハードウェア待ちはすべて回数制限つきのポーリング。
//! タイマーサービスを前提にしないため、壁時計ではなく反復回数で打ち切る。
//!
//! 待ち方は [`WaitPolicy`] として注入し、テストでは即時に進む偽クロックを使う。

use core::fmt;
use log::warn;

use super::XhciConfig;
use crate::io::usb::{UsbError, UsbResult};

/// デフォルトのポーリング回数
pub const DEFAULT_POLL_BUDGET: u32 = 1000;
/// デフォルトの1回あたりのビジーウェイト
pub const DEFAULT_SPINS_PER_DELAY: u32 = 10_000;

/// ポーリング方針
pub trait WaitPolicy {
    /// 条件チェックの最大回数
    fn budget(&self) -> u32;

    /// 失敗したチェックの後の待機
    fn delay(&self);
}

impl<T: WaitPolicy + ?Sized> WaitPolicy for &T {
    fn budget(&self) -> u32 {
        (**self).budget()
    }

    fn delay(&self) {
        (**self).delay()
    }
}

/// ビジーウェイトによる待機
#[derive(Debug, Clone, Copy)]
pub struct SpinWait {
    budget: u32,
    spins_per_delay: u32,
}

impl SpinWait {
    pub const fn new(budget: u32, spins_per_delay: u32) -> Self {
        Self {
            budget,
            spins_per_delay,
        }
    }

    pub fn from_config(config: &XhciConfig) -> Self {
        Self::new(config.poll_budget, config.spins_per_delay)
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_BUDGET, DEFAULT_SPINS_PER_DELAY)
    }
}

impl WaitPolicy for SpinWait {
    fn budget(&self) -> u32 {
        self.budget
    }

    fn delay(&self) {
        for _ in 0..self.spins_per_delay {
            core::hint::spin_loop();
        }
    }
}

/// 何を待っていたか（タイムアウト診断用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    /// USBSTS.HCH がセットされるのを待つ
    ControllerHalt,
    /// USBCMD.HCRST が自動クリアされるのを待つ
    ControllerReset,
    /// USBSTS.CNR がクリアされるのを待つ
    ControllerReady,
    /// USBSTS.HCH がクリアされるのを待つ
    ControllerStart,
    /// PORTSC.PR がクリアされるのを待つ（1始まりのポート番号）
    PortReset(u8),
    /// コマンド完了イベント
    CommandCompletion,
    /// 転送イベント
    TransferCompletion,
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStage::ControllerHalt => write!(f, "controller halt"),
            WaitStage::ControllerReset => write!(f, "controller reset"),
            WaitStage::ControllerReady => write!(f, "controller ready"),
            WaitStage::ControllerStart => write!(f, "controller start"),
            WaitStage::PortReset(port) => write!(f, "port {} reset", port),
            WaitStage::CommandCompletion => write!(f, "command completion"),
            WaitStage::TransferCompletion => write!(f, "transfer completion"),
        }
    }
}

/// 条件が真になるまでポーリング
///
/// 条件は最大 `budget()` 回評価され、偽のたびに `delay()` が1回呼ばれる。
pub fn poll_until<W: WaitPolicy + ?Sized>(wait: &W, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..wait.budget() {
        if done() {
            return true;
        }
        wait.delay();
    }
    false
}

/// レジスタ値が条件を満たすまでポーリング
///
/// 予算切れのときは最後に読んだ値をつけて `UsbError::Timeout` を返す。
pub fn poll_register<W: WaitPolicy + ?Sized>(
    wait: &W,
    stage: WaitStage,
    mut read: impl FnMut() -> u32,
    done: impl Fn(u32) -> bool,
) -> UsbResult<u32> {
    let mut last = 0;
    let satisfied = poll_until(wait, || {
        last = read();
        done(last)
    });
    if satisfied {
        Ok(last)
    } else {
        warn!("xHCI: timeout waiting for {} (last value {:#010x})", stage, last);
        Err(UsbError::Timeout { stage, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct CountingWait {
        budget: u32,
        delays: Cell<u32>,
    }

    impl WaitPolicy for CountingWait {
        fn budget(&self) -> u32 {
            self.budget
        }

        fn delay(&self) {
            self.delays.set(self.delays.get() + 1);
        }
    }

    #[test]
    fn test_exhausts_exact_budget() {
        let wait = CountingWait { budget: 1000, delays: Cell::new(0) };
        let checks = Cell::new(0);
        assert!(!poll_until(&wait, || {
            checks.set(checks.get() + 1);
            false
        }));
        assert_eq!(checks.get(), 1000);
        assert_eq!(wait.delays.get(), 1000);
    }

    #[test]
    fn test_immediate_success_never_delays() {
        let wait = CountingWait { budget: 1000, delays: Cell::new(0) };
        assert!(poll_until(&wait, || true));
        assert_eq!(wait.delays.get(), 0);
    }

    #[test]
    fn test_poll_register_reports_last_value() {
        let wait = CountingWait { budget: 3, delays: Cell::new(0) };
        let value = Cell::new(0x10u32);
        let err = poll_register(
            &wait,
            WaitStage::ControllerReady,
            || {
                value.set(value.get() + 1);
                value.get() | 0x800
            },
            |v| v & 0x800 == 0,
        )
        .unwrap_err();
        assert_eq!(err, UsbError::Timeout { stage: WaitStage::ControllerReady, last: 0x813 });
    }

    #[test]
    fn test_poll_register_returns_satisfying_value() {
        let wait = CountingWait { budget: 10, delays: Cell::new(0) };
        let reads = Cell::new(0u32);
        let v = poll_register(
            &wait,
            WaitStage::ControllerHalt,
            || {
                reads.set(reads.get() + 1);
                if reads.get() >= 4 { 1 } else { 0 }
            },
            |v| v & 1 != 0,
        )
        .unwrap();
        assert_eq!(v, 1);
        assert_eq!(wait.delays.get(), 3);
    }
}

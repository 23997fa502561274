// ============================================================================
// src/io/dma.rs - DMA Memory Capability
// ============================================================================
//!
//! # DMAメモリ
//!
//! ホストコントローラが直接読み書きする物理連続メモリの割り当て。
//! コマンドリング、イベントリング、ERST、DCBAA、デバイスコンテキストは
//! すべて [`DmaAllocator`] から確保される。
//!
//! カーネルはアイデンティティマッピングで動作するため、
//! 仮想アドレスと物理アドレスは一致する。
//!
//! [`DmaBuffer`] は `Drop` を実装しない。解放は必ず
//! [`DmaAllocator::release`] を経由する。

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

use crate::error::MemoryError;

/// DMAバッファの最小アライメント（キャッシュライン / コンテキスト境界）
pub const MIN_DMA_ALIGNMENT: usize = 64;

/// ページアライメント
pub const PAGE_ALIGNMENT: usize = 4096;

// ============================================================================
// DMA Buffer
// ============================================================================

/// コントローラと共有する物理連続バッファ
///
/// すべてのアクセスは volatile で行い、範囲外アクセスは panic する
/// （呼び出し側のオフセット計算バグ）。
#[derive(Debug)]
pub struct DmaBuffer {
    /// バッファへのポインタ
    ptr: NonNull<u8>,
    /// 物理アドレス（DMAエンジン用）
    phys_addr: u64,
    /// バイト長
    len: usize,
    /// 割り当て時のアライメント（解放時に使用）
    align: usize,
}

// バッファは所有者のみが触る
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// 生ポインタからバッファを構築
    ///
    /// # Safety
    /// `ptr` は `len` バイトの読み書き可能でゼロ初期化済みの領域を指し、
    /// 返されたバッファが解放されるまで他から参照されてはならない。
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, phys_addr: u64, len: usize, align: usize) -> Self {
        Self {
            ptr,
            phys_addr,
            len,
            align,
        }
    }

    /// 物理アドレス
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// バイト長
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 割り当てアライメント
    pub fn align(&self) -> usize {
        self.align
    }

    /// 仮想アドレス
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_range(&self, offset: usize, size: usize) {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "DMA access out of bounds: offset {:#x} size {} len {}",
            offset,
            size,
            self.len
        );
    }

    /// 型付き volatile 読み取り
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        self.check_range(offset, core::mem::size_of::<T>());
        debug_assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: 範囲チェック済み、領域はこのバッファが所有
        unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const T) }
    }

    /// 型付き volatile 書き込み
    pub fn write<T: Copy>(&mut self, offset: usize, value: T) {
        self.check_range(offset, core::mem::size_of::<T>());
        debug_assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: 範囲チェック済み、領域はこのバッファが所有
        unsafe { core::ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut T, value) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.read::<u32>(offset)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write::<u32>(offset, value)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        self.read::<u64>(offset)
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write::<u64>(offset, value)
    }

    /// バッファ内容をスライスへコピー
    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        fence(Ordering::Acquire);
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.read::<u8>(offset + i);
        }
    }

    /// スライスからバッファへコピー
    pub fn copy_from_slice(&mut self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        for (i, byte) in src.iter().enumerate() {
            self.write::<u8>(offset + i, *byte);
        }
        fence(Ordering::Release);
    }

    /// 全体をゼロクリア
    pub fn zero(&mut self) {
        for i in 0..self.len {
            self.write::<u8>(i, 0);
        }
    }
}

// ============================================================================
// Allocator Capability
// ============================================================================

/// 物理メモリ割り当てケーパビリティ
///
/// 返すメモリはゼロ初期化済み・物理連続・`align` 以上に整列している必要がある。
pub trait DmaAllocator {
    /// `size` バイトを `align` 境界で確保
    fn allocate(&self, size: usize, align: usize) -> Result<DmaBuffer, MemoryError>;

    /// バッファを返却
    fn release(&self, buffer: DmaBuffer);
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for &T {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaBuffer, MemoryError> {
        (**self).allocate(size, align)
    }

    fn release(&self, buffer: DmaBuffer) {
        (**self).release(buffer)
    }
}

/// カーネルヒープ上のDMAアロケータ
///
/// アイデンティティマッピング前提で、ヒープアドレスをそのまま物理アドレスとして使う。
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelHeapDma;

impl KernelHeapDma {
    pub const fn new() -> Self {
        Self
    }
}

impl DmaAllocator for KernelHeapDma {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaBuffer, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let layout = Layout::from_size_align(size, align.max(MIN_DMA_ALIGNMENT))
            .map_err(|_| MemoryError::InvalidAlignment)?;

        // SAFETY: layout はサイズ非ゼロ
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemoryError::DmaAllocationFailed)?;

        // SAFETY: 確保直後のゼロ初期化済み領域
        Ok(unsafe { DmaBuffer::from_raw_parts(ptr, raw as u64, size, layout.align()) })
    }

    fn release(&self, buffer: DmaBuffer) {
        if let Ok(layout) = Layout::from_size_align(buffer.len, buffer.align) {
            // SAFETY: allocate() で同じレイアウトにより確保された領域
            unsafe { dealloc(buffer.ptr.as_ptr(), layout) }
        }
    }
}

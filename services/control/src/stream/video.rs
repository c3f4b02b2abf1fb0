//! 编码器探测协作方：编码能力位与探测结果。

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// ServerCodecModeSupport 位域。
pub(crate) const SCM_H264: u32 = 0x0000_0001;
pub(crate) const SCM_H264_HIGH8_444: u32 = 0x0000_0002;
pub(crate) const SCM_HEVC: u32 = 0x0000_0100;
pub(crate) const SCM_HEVC_MAIN10: u32 = 0x0000_0200;
pub(crate) const SCM_HEVC_REXT8_444: u32 = 0x0000_0400;
pub(crate) const SCM_HEVC_REXT10_444: u32 = 0x0000_0800;
pub(crate) const SCM_AV1_MAIN8: u32 = 0x0001_0000;
pub(crate) const SCM_AV1_MAIN10: u32 = 0x0002_0000;
pub(crate) const SCM_AV1_HIGH8_444: u32 = 0x0004_0000;
pub(crate) const SCM_AV1_HIGH10_444: u32 = 0x0008_0000;

/// HEVC 支持时上报的最大亮度像素数。
pub(crate) const MAX_LUMA_PIXELS_HEVC: &str = "1869449984";

/// 编码器探测状态。模式值：1 = 仅 H.264 基线，2 = 8bit，3 = 10bit。
pub(crate) struct VideoProbe {
    hevc_mode: AtomicI32,
    av1_mode: AtomicI32,
    /// 各编码族（H264/HEVC/AV1）最近一次探测的 YUV444 支持。
    yuv444: [AtomicBool; 3],
    probe_failed: AtomicBool,
}

impl VideoProbe {
    pub(crate) fn new() -> Self {
        Self {
            hevc_mode: AtomicI32::new(1),
            av1_mode: AtomicI32::new(1),
            yuv444: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
            probe_failed: AtomicBool::new(false),
        }
    }

    /// 重新探测编码器；返回 true 表示探测失败。
    pub(crate) fn probe_encoders(&self) -> bool {
        self.probe_failed.load(Ordering::SeqCst)
    }

    pub(crate) fn active_hevc_mode(&self) -> i32 {
        self.hevc_mode.load(Ordering::SeqCst)
    }

    pub(crate) fn active_av1_mode(&self) -> i32 {
        self.av1_mode.load(Ordering::SeqCst)
    }

    pub(crate) fn set_modes(&self, hevc: i32, av1: i32) {
        self.hevc_mode.store(hevc, Ordering::SeqCst);
        self.av1_mode.store(av1, Ordering::SeqCst);
    }

    pub(crate) fn set_yuv444(&self, codec: usize, supported: bool) {
        if let Some(flag) = self.yuv444.get(codec) {
            flag.store(supported, Ordering::SeqCst);
        }
    }

    pub(crate) fn set_probe_failed(&self, failed: bool) {
        self.probe_failed.store(failed, Ordering::SeqCst);
    }

    fn yuv444_for(&self, codec: usize) -> bool {
        self.yuv444
            .get(codec)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// 汇总编码能力位域。
    pub(crate) fn codec_mode_flags(&self) -> u32 {
        let mut flags = SCM_H264;
        if self.yuv444_for(0) {
            flags |= SCM_H264_HIGH8_444;
        }
        let hevc = self.active_hevc_mode();
        if hevc >= 2 {
            flags |= SCM_HEVC;
            if self.yuv444_for(1) {
                flags |= SCM_HEVC_REXT8_444;
            }
        }
        if hevc >= 3 {
            flags |= SCM_HEVC_MAIN10;
            if self.yuv444_for(1) {
                flags |= SCM_HEVC_REXT10_444;
            }
        }
        let av1 = self.active_av1_mode();
        if av1 >= 2 {
            flags |= SCM_AV1_MAIN8;
            if self.yuv444_for(2) {
                flags |= SCM_AV1_HIGH8_444;
            }
        }
        if av1 >= 3 {
            flags |= SCM_AV1_MAIN10;
            if self.yuv444_for(2) {
                flags |= SCM_AV1_HIGH10_444;
            }
        }
        flags
    }
}

//! Output Geometry
//!
//! Aspect ratio arithmetic and the crop/output rectangle calculation used
//! whenever the input format, zoom mode or target viewport changes.

use serde::{Deserialize, Serialize};

// ============================================================================
// Rational
// ============================================================================

/// Exact fraction, used for sample and display aspect ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const SQUARE: Rational = Rational { num: 1, den: 1 };
    pub const FOUR_THREE: Rational = Rational { num: 4, den: 3 };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Value comparison (2/2 equals 1/1)
    pub fn same_ratio(&self, other: &Rational) -> bool {
        self.num as i128 * other.den as i128 == other.num as i128 * self.den as i128
    }

    /// Reduce `num / den` so that neither part exceeds `max`, using the
    /// closest continued-fraction convergent when an exact reduction
    /// does not fit.
    pub fn reduce(num: i64, den: i64, max: i64) -> Rational {
        if den == 0 {
            return Rational::new(0, 0);
        }
        let negative = (num < 0) != (den < 0);
        let mut n = num.abs();
        let mut d = den.abs();
        let g = gcd(n, d);
        if g > 1 {
            n /= g;
            d /= g;
        }

        let (mut a0, mut a1) = ((0i64, 1i64), (1i64, 0i64));
        if n <= max && d <= max {
            a1 = (n, d);
            d = 0;
        }

        while d != 0 {
            let x = n / d;
            let next_d = n - d * x;
            let a2 = (x * a1.0 + a0.0, x * a1.1 + a0.1);
            if a2.0 > max || a2.1 > max {
                let mut x = x;
                if a1.0 != 0 {
                    x = (max - a0.0) / a1.0;
                }
                if a1.1 != 0 {
                    x = x.min((max - a0.1) / a1.1);
                }
                if d * (2 * x * a1.1 + a0.1) > n * a1.1 {
                    a1 = (x * a1.0 + a0.0, x * a1.1 + a0.1);
                }
                break;
            }
            a0 = a1;
            a1 = a2;
            n = d;
            d = next_d;
        }

        let num = if negative { -a1.0 } else { a1.0 };
        Rational::new(num, a1.1)
    }

    pub fn mul(self, other: Rational) -> Rational {
        Rational::reduce(self.num * other.num, self.den * other.den, i32::MAX as i64)
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

// ============================================================================
// Rectangles and Inputs
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// How a picture whose aspect differs from the viewport is fitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomMode {
    /// Letterbox or pillarbox, aspect preserved
    #[default]
    Normal,
    /// Fill the viewport, aspect ignored
    Stretch,
    /// Fill the viewport, excess cropped from the source
    CenterCutOut,
    /// Treated as stretch
    Anamorphic,
}

impl ZoomMode {
    /// Apply a display-format code: -1 rotate, 0 pan&scan, 1 letterbox,
    /// 2 center cut-out. Unknown codes leave the mode unchanged.
    pub fn from_display_format(code: i32, current: ZoomMode) -> ZoomMode {
        match code {
            -1 => match current {
                ZoomMode::Normal => ZoomMode::Stretch,
                ZoomMode::Stretch => ZoomMode::CenterCutOut,
                ZoomMode::CenterCutOut | ZoomMode::Anamorphic => ZoomMode::Normal,
            },
            0 => ZoomMode::Stretch,
            1 => ZoomMode::Normal,
            2 => ZoomMode::CenterCutOut,
            _ => current,
        }
    }
}

/// Picture format coming out of the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
}

impl Default for InputFormat {
    fn default() -> Self {
        Self { width: 0, height: 0, sample_aspect: Rational::SQUARE }
    }
}

impl InputFormat {
    /// Display aspect of the picture itself, `1:1` when unknown
    pub fn picture_aspect(&self) -> Rational {
        let sar = if self.sample_aspect.is_valid() { self.sample_aspect } else { Rational::SQUARE };
        let dar = Rational::reduce(
            self.width as i64 * sar.num,
            self.height as i64 * sar.den,
            1024 * 1024,
        );
        if dar.is_valid() {
            dar
        } else {
            Rational::SQUARE
        }
    }
}

/// Physical properties of the output screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub width_px: u32,
    pub height_px: u32,
    pub width_mm: u32,
    pub height_mm: u32,
}

impl Default for DisplayInfo {
    fn default() -> Self {
        Self { width_px: 1920, height_px: 1080, width_mm: 480, height_mm: 270 }
    }
}

impl DisplayInfo {
    /// Correction for non-square screen pixels, `1:1` when the physical
    /// size is unknown.
    pub fn pixel_aspect(&self) -> Rational {
        if self.width_mm == 0 || self.height_mm == 0 || self.height_px == 0 || self.width_px == 0 {
            return Rational::SQUARE;
        }
        Rational::new(
            self.width_px as i64 * self.height_mm as i64,
            self.height_px as i64 * self.width_mm as i64,
        )
    }
}

/// Pixels trimmed from each source edge before scaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutMargins {
    pub top_bottom: i32,
    pub left_right: i32,
}

/// Zoom modes for 4:3 material and for everything else
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomModes {
    pub four_three: ZoomMode,
    pub other: ZoomMode,
}

/// Result of the aspect calculation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputGeometry {
    /// Destination rectangle inside the viewport
    pub output: Rect,
    /// Source rectangle inside the decoded picture
    pub crop: Rect,
}

// ============================================================================
// Calculation
// ============================================================================

fn ceil_scale(value: i32, num: i64, den: i64) -> i32 {
    let product = value as i64 * num;
    ((product + den - 1) / den) as i32
}

/// Compute crop and output rectangles for one picture in `video`.
pub fn compute_output(
    input: &InputFormat,
    video: Rect,
    display: &DisplayInfo,
    zoom: &ZoomModes,
    cut: CutMargins,
) -> OutputGeometry {
    let input_w = input.width as i32;
    let input_h = input.height as i32;

    let mut crop = Rect::new(
        cut.left_right,
        cut.top_bottom,
        input_w - 2 * cut.left_right,
        input_h - 2 * cut.top_bottom,
    );
    let mut output = video;

    let picture_aspect = input.picture_aspect();
    let mode = if picture_aspect.same_ratio(&Rational::FOUR_THREE) {
        zoom.four_three
    } else {
        zoom.other
    };

    let dar = picture_aspect.mul(display.pixel_aspect());
    if !dar.is_valid() || video.is_empty() || input_w == 0 || input_h == 0 {
        return OutputGeometry { output, crop };
    }

    tracing::trace!(
        "aspect {}:{} zoom {:?} for {}x{} in {}x{}",
        dar.num, dar.den, mode, input_w, input_h, video.width, video.height
    );

    match mode {
        ZoomMode::Normal => {
            let width = ceil_scale(video.height, dar.num, dar.den);
            let height = ceil_scale(video.width, dar.den, dar.num);
            if width > video.width {
                output.height = height;
                output.y += (video.height - height) / 2;
            } else if height > video.height {
                output.width = width;
                output.x += (video.width - width) / 2;
            }
        }
        ZoomMode::Stretch | ZoomMode::Anamorphic => {}
        ZoomMode::CenterCutOut => {
            let width = ceil_scale(video.height, dar.num, dar.den);
            let height = ceil_scale(video.width, dar.den, dar.num);
            if width > video.width {
                // picture wider than viewport, cut left and right
                crop.height = input_h - 2 * cut.top_bottom;
                let excess = ((width - video.width) as i64 * input_w as i64
                    / (2 * video.width as i64)) as i32;
                crop.x = crop.x.max(excess);
                crop.width = input_w - 2 * crop.x;
            } else if height > video.height {
                crop.width = input_w - 2 * cut.left_right;
                let excess = ((height - video.height) as i64 * input_h as i64
                    / (2 * video.height as i64)) as i32;
                crop.y = crop.y.max(excess);
                crop.height = input_h - 2 * crop.y;
            }
        }
    }

    OutputGeometry { output, crop }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEWPORT: Rect = Rect::new(0, 0, 1920, 1080);

    fn pal_4_3() -> InputFormat {
        InputFormat { width: 720, height: 576, sample_aspect: Rational::new(16, 15) }
    }

    fn zoom(mode: ZoomMode) -> ZoomModes {
        ZoomModes { four_three: mode, other: mode }
    }

    #[test]
    fn test_reduce() {
        assert_eq!(Rational::reduce(1920, 1080, 1024), Rational::new(16, 9));
        assert_eq!(Rational::reduce(-6, 4, 100), Rational::new(-3, 2));
        // pi-ish does not fit, nearest convergent
        assert_eq!(Rational::reduce(314159, 100000, 1000), Rational::new(355, 113));
        assert_eq!(Rational::reduce(5, 0, 10), Rational::new(0, 0));
    }

    #[test]
    fn test_picture_aspect() {
        assert!(pal_4_3().picture_aspect().same_ratio(&Rational::FOUR_THREE));
        let hd = InputFormat { width: 1920, height: 1080, sample_aspect: Rational::SQUARE };
        assert_eq!(hd.picture_aspect(), Rational::new(16, 9));
    }

    #[test]
    fn test_stretch_fills_viewport() {
        let geo = compute_output(
            &pal_4_3(),
            VIEWPORT,
            &DisplayInfo::default(),
            &zoom(ZoomMode::Stretch),
            CutMargins::default(),
        );
        assert_eq!(geo.output, VIEWPORT);
        assert_eq!(geo.crop, Rect::new(0, 0, 720, 576));
    }

    #[test]
    fn test_normal_pillarboxes_4_3() {
        let geo = compute_output(
            &pal_4_3(),
            VIEWPORT,
            &DisplayInfo::default(),
            &zoom(ZoomMode::Normal),
            CutMargins::default(),
        );
        assert_eq!(geo.output, Rect::new(240, 0, 1440, 1080));
    }

    #[test]
    fn test_normal_letterboxes_wide_into_4_3() {
        let hd = InputFormat { width: 1920, height: 1080, sample_aspect: Rational::SQUARE };
        let display = DisplayInfo { width_px: 1024, height_px: 768, width_mm: 400, height_mm: 300 };
        let geo = compute_output(
            &hd,
            Rect::new(0, 0, 1024, 768),
            &display,
            &zoom(ZoomMode::Normal),
            CutMargins::default(),
        );
        assert_eq!(geo.output, Rect::new(0, 96, 1024, 576));
    }

    #[test]
    fn test_matching_aspect_fills() {
        let hd = InputFormat { width: 1920, height: 1080, sample_aspect: Rational::SQUARE };
        let geo = compute_output(
            &hd,
            VIEWPORT,
            &DisplayInfo::default(),
            &zoom(ZoomMode::Normal),
            CutMargins::default(),
        );
        assert_eq!(geo.output, VIEWPORT);
    }

    #[test]
    fn test_center_cut_out_crops() {
        let geo = compute_output(
            &pal_4_3(),
            VIEWPORT,
            &DisplayInfo::default(),
            &zoom(ZoomMode::CenterCutOut),
            CutMargins::default(),
        );
        assert_eq!(geo.output, VIEWPORT);
        assert_eq!(geo.crop, Rect::new(0, 96, 720, 384));
    }

    #[test]
    fn test_cut_margins() {
        let geo = compute_output(
            &pal_4_3(),
            VIEWPORT,
            &DisplayInfo::default(),
            &zoom(ZoomMode::Stretch),
            CutMargins { top_bottom: 4, left_right: 8 },
        );
        assert_eq!(geo.crop, Rect::new(8, 4, 704, 568));
    }

    #[test]
    fn test_4_3_uses_its_own_mode() {
        let modes = ZoomModes { four_three: ZoomMode::Stretch, other: ZoomMode::Normal };
        let geo = compute_output(
            &pal_4_3(),
            VIEWPORT,
            &DisplayInfo::default(),
            &modes,
            CutMargins::default(),
        );
        assert_eq!(geo.output, VIEWPORT);
    }

    #[test]
    fn test_display_format_codes() {
        assert_eq!(ZoomMode::from_display_format(-1, ZoomMode::Normal), ZoomMode::Stretch);
        assert_eq!(ZoomMode::from_display_format(-1, ZoomMode::CenterCutOut), ZoomMode::Normal);
        assert_eq!(ZoomMode::from_display_format(0, ZoomMode::Normal), ZoomMode::Stretch);
        assert_eq!(ZoomMode::from_display_format(1, ZoomMode::Stretch), ZoomMode::Normal);
        assert_eq!(ZoomMode::from_display_format(2, ZoomMode::Normal), ZoomMode::CenterCutOut);
        assert_eq!(ZoomMode::from_display_format(7, ZoomMode::Stretch), ZoomMode::Stretch);
    }
}

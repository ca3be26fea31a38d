//! sRGB ↔ CIE L*a*b* conversion in the common 8-bit encoding.
//!
//! L is scaled from 0–100 to 0–255; a and b are offset by 128. D65 white point.

use image::RgbImage;

const XN: f32 = 0.950_456;
const ZN: f32 = 1.088_754;
/// (6/29)^3; below this the cube root is replaced by a linear segment.
const LAB_EPSILON: f32 = 0.008_856;
const LAB_KAPPA: f32 = 903.3;

/// Planar L*a*b* channels of an image, one byte per sample.
pub struct LabPlanes {
    pub l: Vec<u8>,
    pub a: Vec<u8>,
    pub b: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(f: f32) -> f32 {
    let t = f * f * f;
    if t > LAB_EPSILON {
        t
    } else {
        (f - 16.0 / 116.0) / 7.787
    }
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert one sRGB pixel to 8-bit L*a*b*.
pub fn rgb_to_lab(rgb: [u8; 3], linear: &[f32; 256]) -> [u8; 3] {
    let r = linear[rgb[0] as usize];
    let g = linear[rgb[1] as usize];
    let b = linear[rgb[2] as usize];

    let x = (0.412_453 * r + 0.357_580 * g + 0.180_423 * b) / XN;
    let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
    let z = (0.019_334 * r + 0.119_193 * g + 0.950_227 * b) / ZN;

    let fx = lab_f(x);
    let fy = lab_f(y);
    let fz = lab_f(z);

    let l = if y > LAB_EPSILON {
        116.0 * fy - 16.0
    } else {
        LAB_KAPPA * y
    };
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);

    [to_u8(l * 255.0 / 100.0), to_u8(a + 128.0), to_u8(bb + 128.0)]
}

/// Convert one 8-bit L*a*b* pixel back to sRGB.
pub fn lab_to_rgb(lab: [u8; 3]) -> [u8; 3] {
    let l = lab[0] as f32 * 100.0 / 255.0;
    let a = lab[1] as f32 - 128.0;
    let b = lab[2] as f32 - 128.0;

    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;

    let y = if l > LAB_KAPPA * LAB_EPSILON {
        fy * fy * fy
    } else {
        l / LAB_KAPPA
    };
    let x = lab_f_inv(fx) * XN;
    let z = lab_f_inv(fz) * ZN;

    let r = 3.240_479 * x - 1.537_150 * y - 0.498_535 * z;
    let g = -0.969_256 * x + 1.875_992 * y + 0.041_556 * z;
    let bl = 0.055_648 * x - 0.204_043 * y + 1.057_311 * z;

    [
        to_u8(linear_to_srgb(r.clamp(0.0, 1.0)) * 255.0),
        to_u8(linear_to_srgb(g.clamp(0.0, 1.0)) * 255.0),
        to_u8(linear_to_srgb(bl.clamp(0.0, 1.0)) * 255.0),
    ]
}

/// sRGB byte → linear light lookup table.
pub fn linear_table() -> [f32; 256] {
    std::array::from_fn(|i| srgb_to_linear(i as f32 / 255.0))
}

/// Split an RGB image into planar L*a*b* channels.
pub fn split_lab(img: &RgbImage) -> LabPlanes {
    let linear = linear_table();
    let n = (img.width() * img.height()) as usize;
    let mut planes = LabPlanes {
        l: Vec::with_capacity(n),
        a: Vec::with_capacity(n),
        b: Vec::with_capacity(n),
        width: img.width(),
        height: img.height(),
    };
    for px in img.pixels() {
        let [l, a, b] = rgb_to_lab(px.0, &linear);
        planes.l.push(l);
        planes.a.push(a);
        planes.b.push(b);
    }
    planes
}

/// Recombine planar L*a*b* channels into an RGB image.
pub fn merge_lab(planes: &LabPlanes) -> RgbImage {
    RgbImage::from_fn(planes.width, planes.height, |x, y| {
        let i = (y * planes.width + x) as usize;
        image::Rgb(lab_to_rgb([planes.l[i], planes.a[i], planes.b[i]]))
    })
}

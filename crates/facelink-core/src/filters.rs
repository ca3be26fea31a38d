//! Contrast equalization and edge-preserving smoothing.

use image::RgbImage;

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place
/// to a single 8-bit channel.
///
/// Divides the plane into a `tiles_x × tiles_y` grid, computes a clipped
/// histogram per tile, builds per-tile lookup tables, and uses bilinear
/// interpolation between neighbouring tiles for smooth output.
///
/// `clip_limit` uses the usual relative convention: each bin is clipped at
/// `clip_limit × tile_pixels / 256` (never below 1).
pub fn clahe_enhance(
    plane: &mut [u8],
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    clip_limit: f32,
) {
    let w = width as usize;
    let h = height as usize;
    let tx = tiles_x as usize;
    let ty = tiles_y as usize;
    if w == 0 || h == 0 || tx == 0 || ty == 0 || plane.len() < w * h {
        return;
    }

    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
    let lut_scale = 255.0 / tile_pixels as f32;

    // Per-tile lookup tables
    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[plane[y * w + x] as usize] += 1;
                }
            }

            // Clip and redistribute the excess evenly, then spread the
            // remainder at a fixed stride across the histogram.
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let mut residual = (excess % 256) as usize;
            for bin in hist.iter_mut() {
                *bin += redist;
            }
            if residual > 0 {
                let step = (256 / residual).max(1);
                let mut i = 0;
                while i < 256 && residual > 0 {
                    hist[i] += 1;
                    residual -= 1;
                    i += step;
                }
            }

            let mut lut = [0u8; 256];
            let mut sum = 0u32;
            for (i, bin) in hist.iter().enumerate() {
                sum += bin;
                lut[i] = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    // Map each pixel using bilinear interpolation between tile LUTs
    for y in 0..h {
        let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (ty - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(ty - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (tx - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tx - 1);
            let dx = fx - c0 as f32;

            let pixel = plane[y * w + x] as usize;
            let tl = luts[r0 * tx + c0][pixel] as f32;
            let tr = luts[r0 * tx + c1][pixel] as f32;
            let bl = luts[r1 * tx + c0][pixel] as f32;
            let br = luts[r1 * tx + c1][pixel] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            plane[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Reflect an out-of-range index back into `0..len` without repeating the
/// edge sample (`dcb|abcd|cba`).
fn reflect_101(i: i64, len: usize) -> usize {
    let n = len as i64;
    if n == 1 {
        return 0;
    }
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

/// Edge-preserving bilateral filter over an RGB image.
///
/// Spatial weights cover a circular window of the given diameter. The range
/// weight uses the L1 colour distance summed over the three channels.
pub fn bilateral_filter(
    img: &RgbImage,
    diameter: u32,
    sigma_color: f32,
    sigma_space: f32,
) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let radius = (diameter / 2).max(1) as i64;

    let space_coeff = -0.5 / (sigma_space * sigma_space);
    let color_coeff = -0.5 / (sigma_color * sigma_color);

    // Circular window offsets and their spatial weights
    let mut offsets: Vec<(i64, i64, f32)> = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r = ((dx * dx + dy * dy) as f32).sqrt();
            if r > radius as f32 {
                continue;
            }
            offsets.push((dx, dy, (r * r * space_coeff).exp()));
        }
    }

    let color_weight: Vec<f32> = (0..3 * 256)
        .map(|d| ((d * d) as f32 * color_coeff).exp())
        .collect();

    let src = img.as_raw();
    let stride = w as usize * 3;

    RgbImage::from_fn(w, h, |x, y| {
        let center = y as usize * stride + x as usize * 3;
        let c = [src[center] as i32, src[center + 1] as i32, src[center + 2] as i32];

        let mut sum = [0.0f32; 3];
        let mut wsum = 0.0f32;

        for &(dx, dy, ws) in &offsets {
            let sx = reflect_101(x as i64 + dx, w as usize);
            let sy = reflect_101(y as i64 + dy, h as usize);
            let i = sy * stride + sx * 3;
            let p = [src[i] as i32, src[i + 1] as i32, src[i + 2] as i32];

            let diff = ((p[0] - c[0]).abs() + (p[1] - c[1]).abs() + (p[2] - c[2]).abs()) as usize;
            let weight = ws * color_weight[diff];

            sum[0] += p[0] as f32 * weight;
            sum[1] += p[1] as f32 * weight;
            sum[2] += p[2] as f32 * weight;
            wsum += weight;
        }

        image::Rgb([
            (sum[0] / wsum).round().clamp(0.0, 255.0) as u8,
            (sum[1] / wsum).round().clamp(0.0, 255.0) as u8,
            (sum[2] / wsum).round().clamp(0.0, 255.0) as u8,
        ])
    })
}

use std::path::Path;

use image::{ImageBuffer, Rgb};

#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    LeftHalf,
    TopHalf,
    Checker,
}

/// Write a black/white test image whose layout survives rescaling.
pub fn create_pattern_image(path: &Path, pattern: Pattern, width: u32, height: u32) {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let left = x < width / 2;
        let top = y < height / 2;
        let white = match pattern {
            Pattern::LeftHalf => left,
            Pattern::TopHalf => top,
            Pattern::Checker => left == top,
        };
        let v: u8 = if white { 255 } else { 0 };
        Rgb([v, v, v])
    });
    img.save(path).unwrap();
}

/// Make `dir` read-only. Returns false, with permissions restored, when the
/// current user can still create entries in it (root).
#[cfg(unix)]
pub fn lock_dir(dir: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o555)).unwrap();
    let check = dir.join(".lock-check");
    if std::fs::File::create(&check).is_ok() {
        let _ = std::fs::remove_file(&check);
        unlock_dir(dir);
        return false;
    }
    true
}

#[cfg(unix)]
pub fn unlock_dir(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pattern_image_is_8_bit_black_and_white() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("left.png");
        create_pattern_image(&path, Pattern::LeftHalf, 8, 4);

        let img = image::open(&path).unwrap();
        assert_eq!(img.color(), image::ColorType::Rgb8);
        let rgb = img.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(rgb.get_pixel(7, 3), &Rgb([0, 0, 0]));
    }
}

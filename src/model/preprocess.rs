use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;

/// ImageNet channel means in BGR order, as used by ResNet-50 "caffe" preprocessing.
pub const IMAGENET_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

/// Resize to `width` x `height` and apply ResNet-50 preprocessing.
///
/// Output is `[1, height, width, 3]`, channels in BGR order, zero-centred on
/// the ImageNet means, no scaling.
pub fn resnet50_input(image: &RgbImage, width: u32, height: u32) -> Array4<f32> {
    let resized;
    let source = if image.dimensions() == (width, height) {
        image
    } else {
        resized = image::imageops::resize(image, width, height, FilterType::Triangle);
        &resized
    };
    Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| {
            let rgb = source.get_pixel(x as u32, y as u32);
            rgb[2 - c] as f32 - IMAGENET_BGR_MEAN[c]
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn swaps_to_bgr_and_subtracts_means() {
        let img = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        let input = resnet50_input(&img, 2, 2);
        assert_eq!(input.shape(), &[1, 2, 2, 3]);
        assert!((input[[0, 1, 1, 0]] - (30.0 - 103.939)).abs() < 1e-4);
        assert!((input[[0, 1, 1, 1]] - (20.0 - 116.779)).abs() < 1e-4);
        assert!((input[[0, 1, 1, 2]] - (10.0 - 123.68)).abs() < 1e-4);
    }

    #[test]
    fn resizes_to_requested_shape() {
        let img = RgbImage::new(7, 5);
        assert_eq!(resnet50_input(&img, 4, 3).shape(), &[1, 3, 4, 3]);
    }
}

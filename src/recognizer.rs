//! Recognition driver.

use image::DynamicImage;
use tracing::instrument;

use crate::{
    model::{run, Model, PredictOptions},
    Dataset, DetectionResults, RecognitionResults, Result,
};

/// Recognized text for every item of `ds`, in order.
pub fn recognize<'a, M>(
    model: &'a M,
    ds: &'a Dataset,
    options: &PredictOptions,
) -> impl Iterator<Item = Result<RecognitionResults>> + 'a
where
    M: Model<Output = RecognitionResults> + ?Sized,
{
    run(model, ds, options)
}

/// Crops `dets` out of `image`, recognizes every crop and returns the
/// detections with their text attached.
#[instrument(skip_all, fields(name = dets.name(), boxes = dets.len()))]
pub fn recognize_crops<M>(
    model: &M,
    dets: &DetectionResults,
    image: &DynamicImage,
    options: &PredictOptions,
) -> Result<DetectionResults>
where
    M: Model<Output = RecognitionResults> + ?Sized,
{
    let crops = dets.create_ds(image)?;
    let texts = recognize(model, &crops, options).collect::<Result<Vec<_>>>()?;
    dets.attach_text(&texts)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{model::Tensor, BBox, CoordSpace};

    struct Widths;

    impl Model for Widths {
        type Output = RecognitionResults;

        fn name(&self) -> &str {
            "widths"
        }

        fn predict(
            &self,
            inputs: &[Tensor],
            _options: &PredictOptions,
        ) -> Result<Vec<RecognitionResults>> {
            Ok(inputs
                .iter()
                .map(|input| {
                    let (_, h, w) = input.dim();
                    RecognitionResults::new(w.to_string(), 0.5, w as u32, h as u32)
                })
                .collect())
        }
    }

    #[test]
    fn text_lands_on_the_right_boxes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, Rgb([255, 255, 255])));
        let dets = DetectionResults::new(
            vec![
                BBox::new(0.0, 0.0, 10.0, 5.0, CoordSpace::Absolute),
                BBox::new(20.0, 5.0, 35.0, 15.0, CoordSpace::Absolute),
            ],
            40,
            20,
            "page.png",
        );
        let model: &crate::RecognitionModel = &Widths;
        let read = recognize_crops(model, &dets, &image, &PredictOptions::default()).unwrap();
        let texts = read.iter().map(BBox::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["10", "15"]);
        assert_eq!(read.bboxes()[0].text_confidence(), 0.5);
    }
}

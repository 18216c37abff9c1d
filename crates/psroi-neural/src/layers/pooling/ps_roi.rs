use psroi_core::ops::pooling as ops;
use psroi_core::{convert_boxes_to_roi_format, PoolElement, Result, Tensor, TensorError};
use std::borrow::Cow;
use std::fmt;

/// Spatial scale used when none is given: ROIs are in feature-map coordinates
pub const DEFAULT_SPATIAL_SCALE: f64 = 1.0;

/// Sampling ratio used when none is given: adaptive sampling
pub const DEFAULT_SAMPLING_RATIO: i32 = -1;

/// Pooled output size as `(height, width)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PooledSize {
    pub height: usize,
    pub width: usize,
}

impl PooledSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn square(size: usize) -> Self {
        Self::new(size, size)
    }

    pub fn as_tuple(self) -> (usize, usize) {
        (self.height, self.width)
    }
}

impl From<usize> for PooledSize {
    fn from(size: usize) -> Self {
        Self::square(size)
    }
}

impl From<(usize, usize)> for PooledSize {
    fn from((height, width): (usize, usize)) -> Self {
        Self::new(height, width)
    }
}

impl fmt::Display for PooledSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.height, self.width)
    }
}

/// Regions of interest, either already in `[K, 5]` layout or as one
/// `[L_i, 4]` box tensor per batch item
#[derive(Debug, Clone, Copy)]
pub enum Rois<'a, T> {
    Tensor(&'a Tensor<T>),
    Boxes(&'a [Tensor<T>]),
}

impl<'a, T> From<&'a Tensor<T>> for Rois<'a, T> {
    fn from(rois: &'a Tensor<T>) -> Self {
        Rois::Tensor(rois)
    }
}

impl<'a, T> From<&'a [Tensor<T>]> for Rois<'a, T> {
    fn from(boxes: &'a [Tensor<T>]) -> Self {
        Rois::Boxes(boxes)
    }
}

impl<'a, T> From<&'a Vec<Tensor<T>>> for Rois<'a, T> {
    fn from(boxes: &'a Vec<Tensor<T>>) -> Self {
        Rois::Boxes(boxes.as_slice())
    }
}

impl<'a, T: PoolElement> Rois<'a, T> {
    /// The ROIs in `[K, 5]` layout, converting box lists as needed
    pub fn to_tensor(self) -> Result<Cow<'a, Tensor<T>>> {
        match self {
            Rois::Tensor(rois) => Ok(Cow::Borrowed(rois)),
            Rois::Boxes(boxes) => {
                let rois = convert_boxes_to_roi_format(boxes)?;
                log::trace!(
                    "converted {} box tensors into {} rois",
                    boxes.len(),
                    rois.shape()[0]
                );
                Ok(Cow::Owned(rois))
            }
        }
    }
}

fn feature_shape<T>(operation: &str, input: &Tensor<T>) -> Result<[usize; 4]> {
    input.shape().as_4d().ok_or_else(|| {
        TensorError::invalid_shape(
            operation,
            &format!("Feature maps must be 4D, got {}D", input.rank()),
            input.shape().dims(),
        )
    })
}

/// State saved by [`PsRoiAlign2D::forward_with_context`] for the backward pass
#[derive(Debug, Clone)]
pub struct PsRoiAlignContext<T> {
    rois: Tensor<T>,
    channel_mapping: Tensor<i32>,
    input_shape: [usize; 4],
}

impl<T> PsRoiAlignContext<T> {
    pub fn rois(&self) -> &Tensor<T> {
        &self.rois
    }

    pub fn channel_mapping(&self) -> &Tensor<i32> {
        &self.channel_mapping
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }
}

/// Position-Sensitive ROI Align Layer
/// Light-Head R-CNN style pooling with bilinear sub-pixel sampling
#[derive(Debug, Clone, PartialEq)]
pub struct PsRoiAlign2D {
    output_size: PooledSize,
    spatial_scale: f64,
    sampling_ratio: i32,
}

impl PsRoiAlign2D {
    pub fn new(output_size: impl Into<PooledSize>, spatial_scale: f64, sampling_ratio: i32) -> Self {
        Self {
            output_size: output_size.into(),
            spatial_scale,
            sampling_ratio,
        }
    }

    /// Square pooled size constructor
    pub fn square(size: usize, spatial_scale: f64, sampling_ratio: i32) -> Self {
        Self::new(size, spatial_scale, sampling_ratio)
    }

    /// Auto sampling ratio constructor (sampling_ratio = -1 means adaptive)
    pub fn auto_sampling(output_size: impl Into<PooledSize>, spatial_scale: f64) -> Self {
        Self::new(output_size, spatial_scale, DEFAULT_SAMPLING_RATIO)
    }

    pub fn output_size(&self) -> PooledSize {
        self.output_size
    }

    pub fn spatial_scale(&self) -> f64 {
        self.spatial_scale
    }

    pub fn sampling_ratio(&self) -> i32 {
        self.sampling_ratio
    }

    pub fn forward<'a, T: PoolElement>(
        &self,
        input: &Tensor<T>,
        rois: impl Into<Rois<'a, T>>,
    ) -> Result<Tensor<T>> {
        let rois = rois.into().to_tensor()?;
        let (output, _) = ops::ps_roi_align(
            input,
            &rois,
            self.output_size.as_tuple(),
            self.spatial_scale,
            self.sampling_ratio,
        )?;
        Ok(output)
    }

    /// Forward pass over per-image box lists
    pub fn forward_boxes<T: PoolElement>(
        &self,
        input: &Tensor<T>,
        boxes: &[Tensor<T>],
    ) -> Result<Tensor<T>> {
        self.forward(input, boxes)
    }

    /// Forward pass that also returns the state needed by [`Self::backward`]
    pub fn forward_with_context<'a, T: PoolElement>(
        &self,
        input: &Tensor<T>,
        rois: impl Into<Rois<'a, T>>,
    ) -> Result<(Tensor<T>, PsRoiAlignContext<T>)> {
        let rois = rois.into().to_tensor()?;
        let (output, channel_mapping) = ops::ps_roi_align(
            input,
            &rois,
            self.output_size.as_tuple(),
            self.spatial_scale,
            self.sampling_ratio,
        )?;
        let context = PsRoiAlignContext {
            rois: rois.into_owned(),
            channel_mapping,
            input_shape: feature_shape("ps_roi_align", input)?,
        };
        Ok((output, context))
    }

    /// Gradient with respect to the input of the forward call that produced `context`
    pub fn backward<T: PoolElement>(
        &self,
        context: &PsRoiAlignContext<T>,
        grad_output: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        ops::ps_roi_align_backward(
            grad_output,
            &context.rois,
            &context.channel_mapping,
            context.input_shape,
            self.output_size.as_tuple(),
            self.spatial_scale,
            self.sampling_ratio,
        )
    }
}

impl fmt::Display for PsRoiAlign2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PsRoiAlign2D(output_size={}, spatial_scale={}, sampling_ratio={})",
            self.output_size, self.spatial_scale, self.sampling_ratio
        )
    }
}

/// State saved by [`PsRoiPool2D::forward_with_context`] for the backward pass
#[derive(Debug, Clone)]
pub struct PsRoiPoolContext<T> {
    rois: Tensor<T>,
    channel_mapping: Tensor<i32>,
    input_shape: [usize; 4],
}

impl<T> PsRoiPoolContext<T> {
    pub fn rois(&self) -> &Tensor<T> {
        &self.rois
    }

    pub fn channel_mapping(&self) -> &Tensor<i32> {
        &self.channel_mapping
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }
}

/// Position-Sensitive ROI Pooling Layer
/// R-FCN style pooling over whole-pixel bins
#[derive(Debug, Clone, PartialEq)]
pub struct PsRoiPool2D {
    output_size: PooledSize,
    spatial_scale: f64,
}

impl PsRoiPool2D {
    pub fn new(output_size: impl Into<PooledSize>, spatial_scale: f64) -> Self {
        Self {
            output_size: output_size.into(),
            spatial_scale,
        }
    }

    /// Square pooled size constructor
    pub fn square(size: usize, spatial_scale: f64) -> Self {
        Self::new(size, spatial_scale)
    }

    pub fn output_size(&self) -> PooledSize {
        self.output_size
    }

    pub fn spatial_scale(&self) -> f64 {
        self.spatial_scale
    }

    pub fn forward<'a, T: PoolElement>(
        &self,
        input: &Tensor<T>,
        rois: impl Into<Rois<'a, T>>,
    ) -> Result<Tensor<T>> {
        let rois = rois.into().to_tensor()?;
        let (output, _) =
            ops::ps_roi_pool(input, &rois, self.output_size.as_tuple(), self.spatial_scale)?;
        Ok(output)
    }

    pub fn forward_boxes<T: PoolElement>(
        &self,
        input: &Tensor<T>,
        boxes: &[Tensor<T>],
    ) -> Result<Tensor<T>> {
        self.forward(input, boxes)
    }

    pub fn forward_with_context<'a, T: PoolElement>(
        &self,
        input: &Tensor<T>,
        rois: impl Into<Rois<'a, T>>,
    ) -> Result<(Tensor<T>, PsRoiPoolContext<T>)> {
        let rois = rois.into().to_tensor()?;
        let (output, channel_mapping) =
            ops::ps_roi_pool(input, &rois, self.output_size.as_tuple(), self.spatial_scale)?;
        let context = PsRoiPoolContext {
            rois: rois.into_owned(),
            channel_mapping,
            input_shape: feature_shape("ps_roi_pool", input)?,
        };
        Ok((output, context))
    }

    pub fn backward<T: PoolElement>(
        &self,
        context: &PsRoiPoolContext<T>,
        grad_output: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        ops::ps_roi_pool_backward(
            grad_output,
            &context.rois,
            &context.channel_mapping,
            context.input_shape,
            self.output_size.as_tuple(),
            self.spatial_scale,
        )
    }
}

impl fmt::Display for PsRoiPool2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PsRoiPool2D(output_size={}, spatial_scale={})",
            self.output_size, self.spatial_scale
        )
    }
}

/// Functional position-sensitive ROI Align.
///
/// Callers without a preference pass [`DEFAULT_SPATIAL_SCALE`] and
/// [`DEFAULT_SAMPLING_RATIO`].
pub fn ps_roi_align<'a, T: PoolElement>(
    input: &Tensor<T>,
    rois: impl Into<Rois<'a, T>>,
    output_size: impl Into<PooledSize>,
    spatial_scale: f64,
    sampling_ratio: i32,
) -> Result<Tensor<T>> {
    PsRoiAlign2D::new(output_size, spatial_scale, sampling_ratio).forward(input, rois)
}

/// Functional position-sensitive ROI pooling
pub fn ps_roi_pool<'a, T: PoolElement>(
    input: &Tensor<T>,
    rois: impl Into<Rois<'a, T>>,
    output_size: impl Into<PooledSize>,
    spatial_scale: f64,
) -> Result<Tensor<T>> {
    PsRoiPool2D::new(output_size, spatial_scale).forward(input, rois)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp_input() -> Tensor<f32> {
        let data = (0..2 * 8 * 6 * 6).map(|i| (i % 13) as f32 * 0.5).collect();
        Tensor::from_vec(data, &[2, 8, 6, 6]).unwrap()
    }

    fn boxes() -> Vec<Tensor<f32>> {
        vec![
            Tensor::from_vec(vec![0.0, 0.0, 4.0, 4.0, 1.0, 2.0, 5.5, 6.0], &[2, 4]).unwrap(),
            Tensor::from_vec(vec![0.5, 0.5, 3.0, 5.0], &[1, 4]).unwrap(),
        ]
    }

    #[test]
    fn test_pooled_size_conversions() {
        assert_eq!(PooledSize::from(7usize), PooledSize::new(7, 7));
        assert_eq!(PooledSize::from((3usize, 5usize)).as_tuple(), (3, 5));
        assert_eq!(PooledSize::new(2, 4).to_string(), "(2, 4)");
    }

    #[test]
    fn test_display() {
        let align = PsRoiAlign2D::square(7, 0.0625, 2);
        assert_eq!(
            align.to_string(),
            "PsRoiAlign2D(output_size=(7, 7), spatial_scale=0.0625, sampling_ratio=2)"
        );
        let pool = PsRoiPool2D::square(7, 0.0625);
        assert_eq!(pool.to_string(), "PsRoiPool2D(output_size=(7, 7), spatial_scale=0.0625)");
    }

    #[test]
    fn test_constructors() {
        let layer = PsRoiAlign2D::auto_sampling(PooledSize::new(3, 2), 0.5);
        assert_eq!(layer.sampling_ratio(), DEFAULT_SAMPLING_RATIO);
        assert_eq!(layer.output_size(), PooledSize::new(3, 2));
        assert_eq!(
            PsRoiAlign2D::square(4, 1.0, 2),
            PsRoiAlign2D::new(PooledSize::new(4, 4), 1.0, 2)
        );
    }

    #[test]
    fn test_box_lists_match_roi_tensor() {
        let input = ramp_input();
        let layer = PsRoiAlign2D::square(2, 1.0, 2);
        let boxes = boxes();
        let rois = convert_boxes_to_roi_format(&boxes).unwrap();

        let from_boxes = layer.forward_boxes(&input, &boxes).unwrap();
        let from_rois = layer.forward(&input, &rois).unwrap();
        assert_eq!(from_boxes.shape().dims(), &[3, 2, 2, 2]);
        assert_eq!(from_boxes, from_rois);

        let pool = PsRoiPool2D::square(2, 1.0);
        assert_eq!(
            pool.forward(&input, &boxes).unwrap(),
            pool.forward(&input, &rois).unwrap()
        );
    }

    #[test]
    fn test_context_drives_backward() {
        let input = ramp_input();
        let layer = PsRoiAlign2D::square(2, 1.0, 2);
        let (output, context) = layer.forward_with_context(&input, &boxes()).unwrap();

        assert_eq!(context.input_shape(), [2, 8, 6, 6]);
        assert_eq!(context.rois().shape().dims(), &[3, 5]);
        assert_eq!(context.channel_mapping().shape(), output.shape());

        let grad_output = Tensor::ones(output.shape().dims());
        let grad_input = layer.backward(&context, &grad_output).unwrap();
        assert_eq!(grad_input.shape().dims(), &[2, 8, 6, 6]);
        // Every sample of these boxes falls inside the map.
        let total: f32 = grad_input.as_slice().unwrap().iter().sum();
        assert_abs_diff_eq!(total, output.numel() as f32, epsilon = 1e-3);
    }

    #[test]
    fn test_pool_context_drives_backward() {
        let input = ramp_input();
        let layer = PsRoiPool2D::square(2, 1.0);
        let rois = convert_boxes_to_roi_format(&boxes()).unwrap();
        let (output, context) = layer.forward_with_context(&input, &rois).unwrap();

        let grad_output = Tensor::ones(output.shape().dims());
        let grad_input = layer.backward(&context, &grad_output).unwrap();
        let total: f32 = grad_input.as_slice().unwrap().iter().sum();
        assert_abs_diff_eq!(total, output.numel() as f32, epsilon = 1e-3);
    }

    #[test]
    fn test_functional_helpers() {
        let input = ramp_input();
        let boxes = boxes();
        let size = PooledSize::square(2);
        let output = ps_roi_align(
            &input,
            &boxes,
            size,
            DEFAULT_SPATIAL_SCALE,
            DEFAULT_SAMPLING_RATIO,
        )
        .unwrap();
        let expected = PsRoiAlign2D::auto_sampling(size, 1.0)
            .forward(&input, &boxes)
            .unwrap();
        assert_eq!(output, expected);

        let pooled = ps_roi_pool(&input, &boxes, size, DEFAULT_SPATIAL_SCALE).unwrap();
        assert_eq!(pooled.shape().dims(), &[3, 2, 2, 2]);
    }

    #[test]
    fn test_errors_propagate() {
        let input = Tensor::<f32>::zeros(&[1, 6, 4, 4]);
        let layer = PsRoiAlign2D::square(2, 1.0, 2);
        let rois = Tensor::<f32>::zeros(&[0, 5]);
        let err = layer.forward(&input, &rois).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }
}

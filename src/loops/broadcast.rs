use itertools::Itertools;

use super::{Block, Buffer, Geometry, LoopError, LoopId, Monitor, Settings};
use crate::{
    array::{ArrayView, ArrayViewMut},
    kernel::{KernelArgs, KernelEntry},
    layout::{LayoutError, Shape, Walker, coalesce},
    signature::CoreSignature,
    ufunc::UFunc,
};

/// Broadcasts the loop dimensions of all arguments and binds the core dimensions.
///
/// `shapes` holds one entry per argument, inputs first; outputs not allocated yet are `None`.
/// Supplied outputs must have exactly the broadcast loop shape.
pub fn geometry(
    core: Option<&CoreSignature>,
    nin: usize,
    shapes: &[Option<&Shape>],
) -> Result<Geometry, LoopError> {
    let sizes = match core {
        Some(core) => core.resolve(shapes)?,
        None => vec![],
    };
    let outer = |arg: usize, shape: &Shape| {
        let count = core.map_or(0, |core| core.num_dims(arg));
        Shape::from(&shape[..shape.len() - count])
    };

    let inputs = shapes[..nin]
        .iter()
        .enumerate()
        .filter_map(|(arg, shape)| shape.map(|shape| outer(arg, shape)))
        .collect_vec();
    let shape = Shape::broadcast(&inputs)?;

    for (arg, output) in shapes.iter().enumerate().skip(nin) {
        let Some(output) = output else {
            continue;
        };
        let found = outer(arg, output);
        if found != shape {
            return Err(LayoutError::Broadcast(found, shape).into());
        }
    }

    let core = sizes;
    Ok(Geometry { shape, core })
}

impl Geometry {
    /// Full shape of argument `arg`: the loop shape followed by its core shape.
    pub fn shape_of(&self, core: Option<&CoreSignature>, arg: usize) -> Shape {
        let mut shape = self.shape.clone();
        if let Some(core) = core {
            shape.extend(core.core_shape(arg, &self.core).iter());
        }
        shape
    }
}

/// One call of a kernel over broadcast arguments.
///
/// Construction validates arity, shapes and core dimensions, and decides per argument whether
/// the kernel addresses the array directly or goes through a scratch buffer. Core arguments are
/// buffered a whole core block per element. [`BroadcastLoop::run`] then walks the loop shape,
/// handing the kernel at most [`Settings::bufsize`] elements at a time and applying the error
/// policy after each chunk.
pub struct BroadcastLoop<'a> {
    id: LoopId,
    name: String,
    nin: usize,
    entry: KernelEntry,
    inputs: Vec<ArrayView<'a>>,
    outputs: Vec<ArrayViewMut<'a>>,
    geometry: Geometry,
    /// Coalesced loop shape; the last axis is the one chunks are cut from.
    shape: Vec<usize>,
    /// Coalesced byte strides, per argument.
    strides: Vec<Vec<isize>>,
    core_steps: Vec<isize>,
    buffers: Vec<Option<Buffer>>,
    /// Elements handed to the kernel per call, at most [`Settings::bufsize`].
    chunk: usize,
    settings: Settings,
    needs_api: bool,
}

impl<'a> BroadcastLoop<'a> {
    pub fn new(
        ufunc: &UFunc,
        entry: &KernelEntry,
        inputs: Vec<ArrayView<'a>>,
        outputs: Vec<ArrayViewMut<'a>>,
        settings: Settings,
    ) -> Result<Self, LoopError> {
        let name = ufunc.name().to_string();
        let (nin, nout) = (ufunc.nin(), ufunc.nout());
        let nargs = nin + nout;
        let found = inputs.len() + outputs.len();
        if inputs.len() != nin || outputs.len() != nout {
            return Err(LoopError::Arity {
                name,
                expected: nargs,
                found,
            });
        }
        if entry.nargs() != nargs {
            return Err(LoopError::Arity {
                name: entry.kernel.name().into_owned(),
                expected: nargs,
                found: entry.nargs(),
            });
        }

        let core = ufunc.core_signature();
        let layouts = inputs
            .iter()
            .map(|x| x.layout())
            .chain(outputs.iter().map(|x| x.layout()))
            .collect_vec();
        let shapes = layouts.iter().map(|x| Some(x.shape())).collect_vec();
        let geometry = geometry(core, nin, &shapes)?;

        let mut strides = Vec::with_capacity(nargs);
        let mut core_strides = Vec::with_capacity(nargs);
        for (arg, layout) in layouts.iter().enumerate() {
            let count = core.map_or(0, |core| core.num_dims(arg));
            let (outer, inner) = layout.split_core(count);
            strides.push(outer.broadcast_strides(&geometry.shape)?);
            core_strides.push(inner.strides().to_vec());
        }
        let mut shape = geometry.shape.to_vec();
        coalesce(&mut shape, &mut strides);

        let descrs = inputs
            .iter()
            .map(|x| x.descr())
            .chain(outputs.iter().map(|x| x.descr()))
            .collect_vec();
        let ptrs = inputs
            .iter()
            .map(|x| x.as_ptr())
            .chain(outputs.iter().map(|x| x.as_view().as_ptr()))
            .collect_vec();
        let blocks = (0..nargs)
            .map(|arg| {
                let shape = core.map(|core| core.core_shape(arg, &geometry.core)).unwrap_or_default();
                Block::new(&shape, &core_strides[arg])
            })
            .collect_vec();

        // buffered core arguments take a whole block per element, so fewer elements fit a chunk
        let bufsize = settings.bufsize();
        let chunk = (0..nargs)
            .filter(|&arg| {
                let walked = [&strides[arg][..], &core_strides[arg][..]].concat();
                !Buffer::is_direct(descrs[arg], entry.types[arg], ptrs[arg], &walked)
            })
            .map(|arg| blocks[arg].len())
            .max()
            .map_or(bufsize, |block| (bufsize / block.max(1)).max(1));

        let mut buffers = Vec::with_capacity(nargs);
        for (arg, (&descr, &kernel)) in descrs.iter().zip_eq(entry.types.iter()).enumerate() {
            let buffer = Buffer::plan(
                arg,
                arg >= nin,
                descr,
                kernel,
                ptrs[arg],
                &strides[arg],
                blocks[arg].clone(),
                chunk,
                settings.casting.as_ref(),
            )?;
            buffers.push(buffer);
        }
        let core_steps = core_strides
            .into_iter()
            .zip_eq(buffers.iter())
            .flat_map(|(strides, buffer)| match buffer {
                Some(buffer) => buffer.core_steps().to_vec(),
                None => strides,
            })
            .collect_vec();

        let needs_api = entry.needs_api() || descrs.iter().any(|descr| descr.r#type.is_object());
        let id = LoopId::default();
        let entry = entry.clone();

        let this = Self {
            id,
            name,
            nin,
            entry,
            inputs,
            outputs,
            geometry,
            shape,
            strides,
            core_steps,
            buffers,
            chunk,
            settings,
            needs_api,
        };
        log::debug!(
            "loop {} for {}: kernel {}, shape {}, buffered [{}], {} chunks",
            this.id,
            this.name,
            this.entry,
            this.geometry.shape,
            (0..nargs).filter(|&arg| this.is_buffered(arg)).format(", "),
            this.chunks(),
        );
        Ok(this)
    }

    /// Broadcast loop shape, excluding core dimensions.
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.geometry.shape
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Returns `true` if argument `arg` goes through a scratch buffer.
    #[inline]
    pub fn is_buffered(&self, arg: usize) -> bool {
        self.buffers.get(arg).is_some_and(|buffer| buffer.is_some())
    }

    /// Returns `true` if the call touches boxed elements or calls into the host, in which case the
    /// host lock stays held and the error policy is consulted after every chunk.
    #[inline]
    pub fn needs_api(&self) -> bool {
        self.needs_api
    }

    /// Number of kernel invocations the loop will make.
    pub fn chunks(&self) -> usize {
        let (outer, inner) = self.split();
        outer.iter().product::<usize>() * inner.div_ceil(self.chunk)
    }

    /// Splits the coalesced shape into outer axes and the length of the inner axis.
    fn split(&self) -> (&[usize], usize) {
        match self.shape.split_last() {
            Some((&inner, outer)) => (outer, inner),
            None => (&[], 1),
        }
    }

    /// Runs every chunk. On error, chunks already processed stay written.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(id = %self.id, name = %self.name)))]
    pub fn run(mut self) -> Result<(), LoopError> {
        let nin = self.nin;
        let nargs = self.buffers.len();
        let chunk = self.chunk;

        let mut bases = self.inputs.iter().map(|x| x.as_ptr().cast_mut()).collect_vec();
        bases.extend(self.outputs.iter_mut().map(|x| x.as_mut_ptr()));

        let (outer, inner) = self.split();
        let outer = outer.to_vec();
        let (outer_strides, inner_steps): (Vec<_>, Vec<_>) = self
            .strides
            .iter()
            .map(|strides| match strides.split_last() {
                Some((&inner, outer)) => (outer.to_vec(), inner),
                None => (vec![], 0),
            })
            .unzip();

        let mut monitor = Monitor::new(&self.name, &self.settings, self.needs_api);
        log::trace!(
            "loop {} starts, checking status: {}",
            self.id,
            monitor.is_checking()
        );
        monitor.start();

        let mut walker = Walker::new(&outer, outer_strides);
        let mut ptrs = vec![std::ptr::null_mut::<u8>(); nargs];
        let mut steps = vec![0isize; nargs];
        while let Some(offsets) = walker.next_offsets() {
            let mut start = 0;
            while start < inner {
                let len = chunk.min(inner - start);
                let here = |arg: usize| {
                    bases[arg].wrapping_offset(offsets[arg] + inner_steps[arg] * start as isize)
                };

                for (arg, buffer) in self.buffers.iter_mut().enumerate() {
                    match buffer {
                        None => {
                            ptrs[arg] = here(arg);
                            steps[arg] = inner_steps[arg];
                        }
                        Some(buffer) => {
                            if arg < nin {
                                unsafe { buffer.fill(here(arg), inner_steps[arg], len) };
                            }
                            ptrs[arg] = buffer.ptr();
                            steps[arg] = buffer.step();
                        }
                    }
                }

                let args = KernelArgs {
                    ptrs: &ptrs,
                    steps: &steps,
                    len,
                    core_dims: &self.geometry.core,
                    core_steps: &self.core_steps,
                };
                let kernel = &self.entry.kernel;
                unsafe { kernel.execute(&args) }.map_err(|source| LoopError::Kernel {
                    name: kernel.name().into_owned(),
                    source,
                })?;

                for (arg, buffer) in self.buffers.iter_mut().enumerate().skip(nin) {
                    if let Some(buffer) = buffer {
                        unsafe { buffer.drain(here(arg), inner_steps[arg], len) };
                    }
                }

                monitor.chunk()?;
                start += len;
            }
        }

        monitor.finish();
        Ok(())
    }
}

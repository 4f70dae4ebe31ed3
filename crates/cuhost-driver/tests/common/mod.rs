//! Shared setup for the driver integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use cuhost_driver::emulator::KernelCall;
use cuhost_driver::{Context, ContextFlags, Cuda, EmulatedDriver};

/// Element count the `add` kernel is bounded by.
pub const N: usize = 3;

/// `extern "C" __global__ void add(int *c, const int *a, const int *b)`
pub const ADD_PTX: &str = r#"
.version 7.0
.target sm_50
.address_size 64

.visible .entry add(
    .param .u64 add_param_0,
    .param .u64 add_param_1,
    .param .u64 add_param_2
)
{
    .reg .pred %p<2>;
    .reg .b32 %r<8>;
    .reg .b64 %rd<11>;

    ld.param.u64 %rd1, [add_param_0];
    ld.param.u64 %rd2, [add_param_1];
    ld.param.u64 %rd3, [add_param_2];
    mov.u32 %r1, %ctaid.x;
    mov.u32 %r2, %ntid.x;
    mov.u32 %r3, %tid.x;
    mad.lo.s32 %r4, %r1, %r2, %r3;
    setp.gt.s32 %p1, %r4, 2;
    @%p1 bra $L__BB0_2;

    cvta.to.global.u64 %rd4, %rd1;
    cvta.to.global.u64 %rd5, %rd3;
    cvta.to.global.u64 %rd6, %rd2;
    mul.wide.s32 %rd7, %r4, 4;
    add.s64 %rd8, %rd6, %rd7;
    ld.global.u32 %r5, [%rd8];
    add.s64 %rd9, %rd5, %rd7;
    ld.global.u32 %r6, [%rd9];
    add.s32 %r7, %r6, %r5;
    add.s64 %rd10, %rd4, %rd7;
    st.global.u32 [%rd10], %r7;

$L__BB0_2:
    ret;
}
"#;

/// `extern "C" __global__ void copy(u64 *out, u64 a0, ..., u64 a5)`
pub const COPY_PTX: &str = ".version 7.0\n.target sm_50\n.visible .entry copy(\n)\n{\nret;\n}\n";

pub const COPY_ARITY: usize = 7;

/// `copy_words(u64 *out, const u64 *in, u32 n)`: one word per thread.
pub const COPY_WORDS_PTX: &str =
    ".version 7.0\n.target sm_50\n.visible .entry copy_words(\n)\n{\nret;\n}\n";

fn add_body(call: &mut KernelCall<'_>) -> Result<(), i32> {
    let (c, a, b) = (call.arg(0)?, call.arg(1)?, call.arg(2)?);
    let n = (call.threads() as usize).min(N);
    let a: Vec<i32> = call.read(a, n)?;
    let b: Vec<i32> = call.read(b, n)?;
    let sum: Vec<i32> = a.iter().zip(&b).map(|(x, y)| x.wrapping_add(*y)).collect();
    call.write(c, &sum)
}

fn copy_body(call: &mut KernelCall<'_>) -> Result<(), i32> {
    let out = call.arg(0)?;
    let words: Vec<u64> = call.args()[1..].to_vec();
    call.write(out, &words)
}

fn copy_words_body(call: &mut KernelCall<'_>) -> Result<(), i32> {
    let (out, input) = (call.arg(0)?, call.arg(1)?);
    let n = (call.arg(2)? as usize).min(call.threads() as usize);
    let words: Vec<u64> = call.read(input, n)?;
    call.write(out, &words)
}

/// An emulator that knows the `add`, `copy` and `copy_words` kernels.
pub fn emulator() -> Arc<EmulatedDriver> {
    Arc::new(
        EmulatedDriver::new()
            .with_kernel("add", 3, add_body)
            .with_kernel("copy", COPY_ARITY, copy_body)
            .with_kernel("copy_words", 3, copy_words_body),
    )
}

pub fn context(emu: &Arc<EmulatedDriver>) -> Context {
    let cuda = Cuda::with_driver(emu.clone()).unwrap();
    let device = cuda.device(0).unwrap();
    Context::create(&device, ContextFlags::default()).unwrap()
}

//! Default CPU exception handlers.
//!
//! All handlers use the `x86-interrupt` ABI. Most panic with the exception name
//! and stack frame. `debug` and `breakpoint` log and return for debugging.

// Handler names are self-documenting; suppress missing_docs for this module.
#![allow(missing_docs)]

use crate::arch::x86_64::structures::idt::InterruptStackFrame;

pub extern "x86-interrupt" fn divide_error(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: DIVIDE ERROR\n{:#?}", frame);
}

pub extern "x86-interrupt" fn debug(frame: InterruptStackFrame) {
    crate::klog_warn!("EXCEPTION: DEBUG\n{:#?}", frame);
}

pub extern "x86-interrupt" fn nmi(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: NON-MASKABLE INTERRUPT\n{:#?}", frame);
}

pub extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
    crate::klog_warn!("EXCEPTION: BREAKPOINT\n{:#?}", frame);
}

pub extern "x86-interrupt" fn overflow(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: OVERFLOW\n{:#?}", frame);
}

pub extern "x86-interrupt" fn bound_range(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: BOUND RANGE EXCEEDED\n{:#?}", frame);
}

pub extern "x86-interrupt" fn invalid_opcode(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", frame);
}

pub extern "x86-interrupt" fn device_not_available(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: DEVICE NOT AVAILABLE\n{:#?}", frame);
}

pub extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: DOUBLE FAULT (error_code={})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn invalid_tss(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: INVALID TSS (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn segment_not_present(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: SEGMENT NOT PRESENT (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn stack_segment_fault(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: STACK-SEGMENT FAULT (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn general_protection(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
    use crate::arch::x86_64::structures::paging::PageFaultErrorCode;
    use crate::arch::x86_64::registers::control::Cr2;

    let cr2 = Cr2::read();
    let error = PageFaultErrorCode::from_bits_truncate(error_code);

    // Corrupted page table — unrecoverable.
    if error.contains(PageFaultErrorCode::RESERVED_WRITE) {
        crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
        panic!(
            "PAGE FAULT: corrupted page table (reserved bit set)\n  \
             Address: {cr2:#x}\n  Error: {error:?}\n{frame:#?}"
        );
    }

    let access = if error.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        "instruction fetch"
    } else if error.contains(PageFaultErrorCode::WRITE) {
        "write"
    } else {
        "read"
    };

    let cause = if error.contains(PageFaultErrorCode::PRESENT) {
        "protection violation"
    } else {
        "page not present"
    };

    // All code runs in ring 0; every fault reaching here is a kernel bug.
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "PAGE FAULT: {cause} during kernel {access}\n  \
         Address: {cr2:#x}\n  Error: {error:?}\n{frame:#?}"
    );
}

pub extern "x86-interrupt" fn x87_floating_point(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: x87 FLOATING-POINT\n{:#?}", frame);
}

pub extern "x86-interrupt" fn alignment_check(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: ALIGNMENT CHECK (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: MACHINE CHECK\n{:#?}", frame);
}

pub extern "x86-interrupt" fn simd_floating_point(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: SIMD FLOATING-POINT\n{:#?}", frame);
}

pub extern "x86-interrupt" fn virtualization(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: VIRTUALIZATION\n{:#?}", frame);
}

pub extern "x86-interrupt" fn control_protection(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: CONTROL PROTECTION (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn hypervisor_injection(frame: InterruptStackFrame) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!("EXCEPTION: HYPERVISOR INJECTION\n{:#?}", frame);
}

pub extern "x86-interrupt" fn vmm_communication(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: VMM COMMUNICATION (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

pub extern "x86-interrupt" fn security_exception(frame: InterruptStackFrame, error_code: u64) {
    crate::error::set_kind(crate::error::PanicKind::UnhandledInterrupt);
    panic!(
        "EXCEPTION: SECURITY EXCEPTION (error_code={:#x})\n{:#?}",
        error_code, frame
    );
}

//! Indices into the special objects array and the fixed slots of kernel objects.

pub const NIL_OBJECT: usize = 0;
pub const FALSE_OBJECT: usize = 1;
pub const TRUE_OBJECT: usize = 2;
pub const SCHEDULER_ASSOCIATION: usize = 3;
pub const CLASS_BITMAP: usize = 4;
pub const CLASS_SMALL_INTEGER: usize = 5;
pub const CLASS_STRING: usize = 6;
pub const CLASS_ARRAY: usize = 7;
pub const SMALLTALK_DICTIONARY: usize = 8;
pub const CLASS_FLOAT: usize = 9;
pub const CLASS_METHOD_CONTEXT: usize = 10;
pub const CLASS_BLOCK_CONTEXT: usize = 11;
pub const CLASS_POINT: usize = 12;
pub const CLASS_LARGE_POSITIVE_INTEGER: usize = 13;
pub const THE_DISPLAY: usize = 14;
pub const CLASS_MESSAGE: usize = 15;
pub const CLASS_COMPILED_METHOD: usize = 16;
pub const THE_LOW_SPACE_SEMAPHORE: usize = 17;
pub const CLASS_SEMAPHORE: usize = 18;
pub const CLASS_CHARACTER: usize = 19;
pub const SELECTOR_DOES_NOT_UNDERSTAND: usize = 20;
pub const SELECTOR_CANNOT_RETURN: usize = 21;
pub const PROCESS_SIGNALING_LOW_SPACE: usize = 22;
pub const SPECIAL_SELECTORS: usize = 23;
pub const CHARACTER_TABLE: usize = 24;
pub const SELECTOR_MUST_BE_BOOLEAN: usize = 25;
pub const CLASS_BYTE_ARRAY: usize = 26;
pub const CLASS_PROCESS: usize = 27;
pub const COMPACT_CLASSES: usize = 28;
pub const THE_TIMER_SEMAPHORE: usize = 29;
pub const THE_INTERRUPT_SEMAPHORE: usize = 30;
pub const SELECTOR_CANNOT_INTERPRET: usize = 34;
pub const CLASS_BLOCK_CLOSURE: usize = 36;
pub const CLASS_FULL_BLOCK_CLOSURE: usize = 37;
pub const EXTERNAL_OBJECTS_ARRAY: usize = 38;
pub const CLASS_MUTEX: usize = 39;
pub const THE_FINALIZATION_SEMAPHORE: usize = 41;
pub const CLASS_LARGE_NEGATIVE_INTEGER: usize = 42;
pub const SELECTOR_ABOUT_TO_RETURN: usize = 48;
pub const SELECTOR_RUN_WITH_IN: usize = 49;
pub const SELECTOR_ATTEMPT_TO_ASSIGN: usize = 50;
pub const PRIM_ERR_TABLE_INDEX: usize = 51;
pub const CLASS_WEAK_FINALIZER: usize = 55;
pub const SELECTOR_UNKNOWN_BYTECODE: usize = 57;
pub const SELECTOR_COUNTER_TRIPPED: usize = 58;
pub const SELECTOR_SISTA_TRAP: usize = 59;

pub const SPECIAL_OBJECTS_SIZE: usize = 60;

// Behavior
pub const CLASS_SUPERCLASS_INDEX: usize = 0;
pub const CLASS_MESSAGE_DICT_INDEX: usize = 1;
pub const CLASS_FORMAT_INDEX: usize = 2;
pub const CLASS_NAME_INDEX: usize = 6;
pub const METACLASS_THIS_CLASS_INDEX: usize = 5;

// MethodDictionary
pub const MESSAGE_DICT_TALLY_INDEX: usize = 0;
pub const MESSAGE_DICT_METHOD_ARRAY_INDEX: usize = 1;
pub const MESSAGE_DICT_SELECTOR_START: usize = 2;

// Association
pub const ASSOCIATION_KEY_INDEX: usize = 0;
pub const ASSOCIATION_VALUE_INDEX: usize = 1;

// Message
pub const MESSAGE_SELECTOR_INDEX: usize = 0;
pub const MESSAGE_ARGUMENTS_INDEX: usize = 1;
pub const MESSAGE_LOOKUP_CLASS_INDEX: usize = 2;
pub const MESSAGE_SIZE: usize = 3;

// Context
pub const CONTEXT_SENDER_INDEX: usize = 0;
pub const CONTEXT_PC_INDEX: usize = 1;
pub const CONTEXT_STACKP_INDEX: usize = 2;
pub const CONTEXT_METHOD_INDEX: usize = 3;
pub const CONTEXT_CLOSURE_INDEX: usize = 4;
pub const CONTEXT_RECEIVER_INDEX: usize = 5;
pub const CONTEXT_TEMP_FRAME_START: usize = 6;
pub const CONTEXT_SMALL_FRAME: usize = 16;
pub const CONTEXT_LARGE_FRAME: usize = 56;

// Legacy BlockContext
pub const BLOCK_CALLER_INDEX: usize = 0;
pub const BLOCK_ARGUMENT_COUNT_INDEX: usize = 3;
pub const BLOCK_INITIAL_IP_INDEX: usize = 4;
pub const BLOCK_HOME_INDEX: usize = 5;

// BlockClosure and FullBlockClosure
pub const CLOSURE_OUTER_CONTEXT_INDEX: usize = 0;
pub const CLOSURE_START_PC_INDEX: usize = 1;
pub const CLOSURE_COMPILED_BLOCK_INDEX: usize = 1;
pub const CLOSURE_NUM_ARGS_INDEX: usize = 2;
pub const CLOSURE_FIRST_COPIED_INDEX: usize = 3;
pub const FULL_CLOSURE_RECEIVER_INDEX: usize = 3;
pub const FULL_CLOSURE_FIRST_COPIED_INDEX: usize = 4;

// ProcessorScheduler and Process
pub const SCHEDULER_PROCESS_LISTS_INDEX: usize = 0;
pub const SCHEDULER_ACTIVE_PROCESS_INDEX: usize = 1;
pub const PROCESS_NEXT_LINK_INDEX: usize = 0;
pub const PROCESS_SUSPENDED_CONTEXT_INDEX: usize = 1;
pub const PROCESS_PRIORITY_INDEX: usize = 2;
pub const PROCESS_MY_LIST_INDEX: usize = 3;

// LinkedList, Semaphore and Mutex
pub const LIST_FIRST_LINK_INDEX: usize = 0;
pub const LIST_LAST_LINK_INDEX: usize = 1;
pub const SEMAPHORE_EXCESS_SIGNALS_INDEX: usize = 2;
pub const MUTEX_OWNER_INDEX: usize = 2;

// Point
pub const POINT_X_INDEX: usize = 0;
pub const POINT_Y_INDEX: usize = 1;
